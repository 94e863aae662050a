use tracing::{debug, info};

use super::{FlowNodeExecutor, MESSAGE_LOCK};
use crate::{
    ProcflowError, Result, TenantId, Vars,
    engine::WorkKind,
    expression::Expression,
    model::{DataMapping, EventTrigger},
    scheduler::{JobDescriptor, Trigger, jobs::TriggerTimerEventJob},
    store::{
        Query,
        data::{FlowNodeInstance, MessageInstance, WaitingEvent, WaitingEventKind},
    },
    utils,
};

impl FlowNodeExecutor {
    /// Subscribes a catch or boundary event to its trigger.
    pub(super) fn arm(
        &self,
        fni: &FlowNodeInstance,
        trigger: &EventTrigger,
    ) -> Result<()> {
        match trigger {
            EventTrigger::Timer {
                ..
            } => self.schedule_timer(fni, trigger),
            EventTrigger::Message {
                name,
                correlation,
            } => self.wait_for_message(fni, name, correlation.as_ref()),
            EventTrigger::Signal {
                name,
            } => self.insert_waiting(fni, WaitingEventKind::Signal, name, None),
        }
    }

    /// Schedules the `timer-<id>` job of a timer event. It runs once the transaction commits.
    fn schedule_timer(
        &self,
        fni: &FlowNodeInstance,
        trigger: &EventTrigger,
    ) -> Result<()> {
        let job_name = format!("timer-{}", fni.id);
        let schedule = Trigger::from_timer(&job_name, trigger)?;
        let content = TriggerTimerEventJob {
            tenant_id: fni.tenant_id,
            flow_node_instance_id: fni.id,
        };
        let descriptor = JobDescriptor::new(fni.tenant_id, &job_name, &content)?.disallow_concurrent_execution();
        self.scheduler.schedule(descriptor, schedule)?;
        self.insert_waiting(fni, WaitingEventKind::Timer, &job_name, None)
    }

    /// Drops every subscription of `fni`, deleting timer jobs on commit.
    pub(super) fn release_triggers(
        &self,
        fni: &FlowNodeInstance,
    ) -> Result<()> {
        let waiting: Vec<WaitingEvent> = self.store.list(fni.tenant_id, &Query::new().eq("flow_node_instance_id", fni.id))?;
        for event in waiting {
            if event.kind == WaitingEventKind::Timer {
                self.scheduler.delete_job(&fni.tenant_id.to_string(), &event.name)?;
            }
            self.recorder.delete::<WaitingEvent>(fni.tenant_id, event.id)?;
        }
        Ok(())
    }

    pub(super) fn wait_for_message(
        &self,
        fni: &FlowNodeInstance,
        name: &str,
        correlation: Option<&Expression>,
    ) -> Result<()> {
        let correlation = match correlation {
            Some(expr) => {
                let context = self.process_data(fni.tenant_id, fni.process_instance_id)?;
                self.evaluator.evaluate_string(expr, &context)?
            }
            None => None,
        };
        self.insert_waiting(fni, WaitingEventKind::Message, name, correlation)?;
        // a message may already be waiting for this subscription
        self.works.register(fni.tenant_id, WorkKind::MatchMessages)
    }

    fn insert_waiting(
        &self,
        fni: &FlowNodeInstance,
        kind: WaitingEventKind,
        name: &str,
        correlation: Option<String>,
    ) -> Result<()> {
        let event = WaitingEvent {
            id: self.store.next_id::<WaitingEvent>(fni.tenant_id)?,
            tenant_id: fni.tenant_id,
            kind,
            name: name.to_string(),
            correlation,
            process_instance_id: fni.process_instance_id,
            flow_node_instance_id: fni.id,
            active: true,
            delivered: None,
        };
        self.recorder.insert(&event)
    }

    /// Sends the message or broadcasts the signal of a throw event.
    pub(super) fn throw(
        &self,
        fni: &FlowNodeInstance,
        trigger: &EventTrigger,
        payload: &[DataMapping],
    ) -> Result<()> {
        let context = self.process_data(fni.tenant_id, fni.process_instance_id)?;
        let payload = self.map_data(payload, &context)?;
        match trigger {
            EventTrigger::Message {
                name,
                correlation,
            } => {
                let correlation = match correlation {
                    Some(expr) => self.evaluator.evaluate_string(expr, &context)?,
                    None => None,
                };
                self.send_message(fni.tenant_id, name, correlation, payload)?;
            }
            EventTrigger::Signal {
                name,
            } => {
                self.broadcast_signal(fni.tenant_id, name, payload)?;
            }
            EventTrigger::Timer {
                ..
            } => return Err(ProcflowError::Definition(format!("throw event '{}' cannot carry a timer", fni.flow_node_id))),
        }
        Ok(())
    }

    /// Stores a message and queues a matching pass once the transaction commits.
    pub fn send_message(
        &self,
        tenant_id: TenantId,
        name: &str,
        correlation: Option<String>,
        payload: Vars,
    ) -> Result<u64> {
        let message = MessageInstance {
            id: self.store.next_id::<MessageInstance>(tenant_id)?,
            tenant_id,
            name: name.to_string(),
            correlation,
            payload,
            sent_at: utils::time::time_millis(),
            handled: false,
        };
        self.recorder.insert(&message)?;
        self.works.register(tenant_id, WorkKind::MatchMessages)?;
        debug!(tenant_id, message_id = message.id, name, "message sent");
        Ok(message.id)
    }

    /// Triggers every active catcher of signal `name`. Returns the number of catchers.
    pub fn broadcast_signal(
        &self,
        tenant_id: TenantId,
        name: &str,
        payload: Vars,
    ) -> Result<usize> {
        let waiting: Vec<WaitingEvent> = self.store.list(
            tenant_id,
            &Query::new().eq("kind", WaitingEventKind::Signal.as_ref()).eq("name", name).eq("active", true),
        )?;
        for mut event in waiting.iter().cloned() {
            event.active = false;
            event.delivered = Some(payload.clone());
            self.recorder.update_entity(&event)?;
            self.works.register(tenant_id, WorkKind::TriggerFlowNode {
                flow_node_instance_id: event.flow_node_instance_id,
                payload: payload.clone(),
            })?;
        }
        info!(tenant_id, signal = name, catchers = waiting.len(), "signal broadcast");
        Ok(waiting.len())
    }

    /// Pairs pending messages with waiting receivers under the tenant message lock, so a
    /// message is consumed at most once. Returns the number of matches.
    pub(crate) fn match_messages(
        &self,
        tenant_id: TenantId,
    ) -> Result<usize> {
        self.with_retries(|| {
            let mut locks = self.transition_locks(tenant_id);
            locks.acquire(0, MESSAGE_LOCK)?;
            self.txs.execute_in_transaction(|| {
                let messages: Vec<MessageInstance> = self.store.list(tenant_id, &Query::new().eq("handled", false))?;
                let mut matched = 0;
                for mut message in messages {
                    let candidates: Vec<WaitingEvent> = self.store.list(
                        tenant_id,
                        &Query::new().eq("kind", WaitingEventKind::Message.as_ref()).eq("name", message.name.as_str()).eq("active", true),
                    )?;
                    let Some(mut waiting) = candidates.into_iter().find(|w| w.correlation.is_none() || w.correlation == message.correlation) else {
                        continue;
                    };
                    waiting.active = false;
                    waiting.delivered = Some(message.payload.clone());
                    self.recorder.update_entity(&waiting)?;
                    message.handled = true;
                    self.recorder.update_entity(&message)?;
                    self.works.register(tenant_id, WorkKind::TriggerFlowNode {
                        flow_node_instance_id: waiting.flow_node_instance_id,
                        payload: message.payload.clone(),
                    })?;
                    debug!(tenant_id, message_id = message.id, flow_node_instance_id = waiting.flow_node_instance_id, "message matched");
                    matched += 1;
                }
                Ok(matched)
            })
        })
    }
}
