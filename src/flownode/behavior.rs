use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{FlowNodeExecutor, FlowNodeState, Stimulus, TransitionOutcome};
use crate::{
    ProcflowError, Result, TenantId, UserId, Vars,
    model::{DataMapping, FlowNodeDefinition, FlowNodeKind, Operation, Operator},
    store::{
        Query,
        data::{Actor, ActorMember, ActorMemberKind, FlowNodeInstance},
    },
    utils,
    workflow::ProcessGraph,
};

impl FlowNodeExecutor {
    /// Drives `fni` until it reaches a stable state, then archives it and moves the
    /// token on when the state is terminal.
    pub(super) fn run_to_stable(
        &self,
        fni: &mut FlowNodeInstance,
        stimulus: Stimulus,
    ) -> Result<TransitionOutcome> {
        let graph = self.graph(fni.tenant_id, fni.definition_id)?;
        let definition = graph.flow_node(&fni.flow_node_id)?.clone();

        // a plain execution only matters to a gateway re-checking its merge condition
        let mut stimulus = match stimulus {
            Stimulus::Execute if fni.state != FlowNodeState::Waiting => None,
            other => Some(other),
        };

        while !fni.terminal {
            let Some(next) = self.step(fni, &definition, &graph, &mut stimulus)? else {
                break;
            };
            self.change_state(fni, next)?;
            if fni.stable && !fni.terminal && fni.kind.is_activity() {
                self.create_boundaries(fni, &graph)?;
            }
        }

        match stimulus {
            Some(Stimulus::UserExecution {
                ..
            }) => {
                return Err(ProcflowError::Execution(format!("flow node {} is {}, not a ready user task", fni.id, fni.state.as_ref())));
            }
            Some(Stimulus::Trigger(_)) => {
                warn!(tenant_id = fni.tenant_id, flow_node_instance_id = fni.id, state = fni.state.as_ref(), "trigger ignored, flow node is not waiting")
            }
            _ => {}
        }

        let outcome = TransitionOutcome {
            flow_node_instance_id: fni.id,
            state: fni.state,
            stable: fni.stable,
            terminal: fni.terminal,
        };
        if fni.terminal {
            self.archive_flow_node(fni)?;
            if fni.state == FlowNodeState::Completed {
                self.take_outgoing(fni, &definition, &graph)?;
            }
            self.after_flow_node_removed(fni.tenant_id, fni.process_instance_id, &graph)?;
        }
        debug!(
            tenant_id = fni.tenant_id,
            flow_node_instance_id = fni.id,
            flow_node = %fni.flow_node_id,
            state = fni.state.as_ref(),
            "transition reached a stable state"
        );
        Ok(outcome)
    }

    /// Moves `fni` to `state` and records the update.
    pub(super) fn change_state(
        &self,
        fni: &mut FlowNodeInstance,
        state: FlowNodeState,
    ) -> Result<()> {
        let now = utils::time::time_millis();
        trace!(flow_node_instance_id = fni.id, from = fni.state.as_ref(), to = state.as_ref(), "flow node state change");
        fni.previous_state = Some(fni.state);
        fni.state = state;
        fni.stable = state.is_stable_for(fni.kind);
        fni.terminal = state.is_terminal();
        fni.reached_state_date = now;
        fni.last_update = now;
        self.recorder.update_entity(fni)
    }

    /// Behavior of the current state. `None` means the node stays where it is.
    fn step(
        &self,
        fni: &mut FlowNodeInstance,
        definition: &FlowNodeDefinition,
        graph: &ProcessGraph,
        stimulus: &mut Option<Stimulus>,
    ) -> Result<Option<FlowNodeState>> {
        let next = match fni.state {
            FlowNodeState::Initializing => match &definition.kind {
                FlowNodeKind::UserTask {
                    actor,
                    ..
                } => {
                    self.resolve_actor(fni, actor)?;
                    Some(FlowNodeState::Ready)
                }
                _ => Some(FlowNodeState::Executing),
            },
            FlowNodeState::Ready => match stimulus {
                Some(Stimulus::UserExecution {
                    user_id,
                    ..
                }) => {
                    self.check_actor(fni, *user_id)?;
                    Some(FlowNodeState::Executing)
                }
                _ => None,
            },
            FlowNodeState::Executing => Some(self.execute_behavior(fni, definition, graph, stimulus)?),
            FlowNodeState::Waiting => self.on_waiting(fni, definition, graph, stimulus)?,
            FlowNodeState::Completing => {
                self.release_triggers(fni)?;
                if fni.kind.is_activity() {
                    self.cancel_boundaries(fni, None)?;
                }
                Some(FlowNodeState::Completed)
            }
            FlowNodeState::Aborting | FlowNodeState::Cancelling => {
                self.release_triggers(fni)?;
                self.cancel_boundaries(fni, None)?;
                if fni.state == FlowNodeState::Aborting { Some(FlowNodeState::Aborted) } else { Some(FlowNodeState::Cancelled) }
            }
            FlowNodeState::Failed | FlowNodeState::Completed | FlowNodeState::Aborted | FlowNodeState::Cancelled => None,
        };
        Ok(next)
    }

    fn execute_behavior(
        &self,
        fni: &mut FlowNodeInstance,
        definition: &FlowNodeDefinition,
        graph: &ProcessGraph,
        stimulus: &mut Option<Stimulus>,
    ) -> Result<FlowNodeState> {
        let next = match &definition.kind {
            FlowNodeKind::StartEvent {
                ..
            }
            | FlowNodeKind::ExclusiveGateway {
                ..
            } => FlowNodeState::Completing,
            FlowNodeKind::EndEvent {
                terminate,
            } => {
                if *terminate {
                    self.terminate_process(fni)?;
                }
                FlowNodeState::Completing
            }
            FlowNodeKind::AutomaticTask {
                operations,
            } => {
                self.apply_operations(fni, operations, None)?;
                FlowNodeState::Completing
            }
            FlowNodeKind::UserTask {
                contract,
                operations,
                ..
            } => {
                let inputs = match stimulus.take() {
                    Some(Stimulus::UserExecution {
                        user_id,
                        inputs,
                    }) => {
                        fni.executed_by = Some(user_id);
                        inputs
                    }
                    _ => Vars::new(),
                };
                if let Some(contract) = contract {
                    self.contracts.validate(contract, &inputs)?;
                }
                self.apply_operations(fni, operations, Some(&inputs))?;
                FlowNodeState::Completing
            }
            FlowNodeKind::SendTask {
                message,
                correlation,
                payload,
            } => {
                let context = self.process_data(fni.tenant_id, fni.process_instance_id)?;
                let correlation = match correlation {
                    Some(expr) => self.evaluator.evaluate_string(expr, &context)?,
                    None => None,
                };
                let payload = self.map_data(payload, &context)?;
                self.send_message(fni.tenant_id, message, correlation, payload)?;
                FlowNodeState::Completing
            }
            FlowNodeKind::ReceiveTask {
                message,
                correlation,
                ..
            } => {
                self.wait_for_message(fni, message, correlation.as_ref())?;
                FlowNodeState::Waiting
            }
            FlowNodeKind::CallActivity {
                process,
                version,
                inputs,
                ..
            } => {
                self.start_called_process(fni, process, version.as_deref(), inputs)?;
                FlowNodeState::Waiting
            }
            FlowNodeKind::ParallelGateway
            | FlowNodeKind::InclusiveGateway {
                ..
            } => {
                if self.can_merge(fni, graph)? {
                    FlowNodeState::Completing
                } else {
                    FlowNodeState::Waiting
                }
            }
            FlowNodeKind::IntermediateCatchEvent {
                trigger,
                ..
            }
            | FlowNodeKind::BoundaryEvent {
                trigger,
                ..
            } => {
                self.arm(fni, trigger)?;
                FlowNodeState::Waiting
            }
            FlowNodeKind::IntermediateThrowEvent {
                trigger,
                payload,
            } => {
                self.throw(fni, trigger, payload)?;
                FlowNodeState::Completing
            }
        };
        Ok(next)
    }

    fn on_waiting(
        &self,
        fni: &mut FlowNodeInstance,
        definition: &FlowNodeDefinition,
        graph: &ProcessGraph,
        stimulus: &mut Option<Stimulus>,
    ) -> Result<Option<FlowNodeState>> {
        match &definition.kind {
            FlowNodeKind::ParallelGateway
            | FlowNodeKind::InclusiveGateway {
                ..
            } => {
                if !matches!(stimulus, Some(Stimulus::Execute)) {
                    return Ok(None);
                }
                stimulus.take();
                Ok(if self.can_merge(fni, graph)? { Some(FlowNodeState::Completing) } else { None })
            }
            FlowNodeKind::ReceiveTask {
                outputs,
                ..
            }
            | FlowNodeKind::IntermediateCatchEvent {
                outputs,
                ..
            }
            | FlowNodeKind::CallActivity {
                outputs,
                ..
            } => {
                let Some(payload) = take_trigger(stimulus) else {
                    return Ok(None);
                };
                fni.triggered = true;
                self.apply_mappings(fni, outputs, &payload)?;
                Ok(Some(FlowNodeState::Completing))
            }
            FlowNodeKind::BoundaryEvent {
                interrupting,
                ..
            } => {
                if take_trigger(stimulus).is_none() {
                    return Ok(None);
                }
                fni.triggered = true;
                if *interrupting {
                    self.interrupt_attached(fni)?;
                }
                Ok(Some(FlowNodeState::Completing))
            }
            _ => Ok(None),
        }
    }

    fn resolve_actor(
        &self,
        fni: &mut FlowNodeInstance,
        actor_name: &str,
    ) -> Result<()> {
        let actor: Option<Actor> = self.store.first(fni.tenant_id, &Query::new().eq("definition_id", fni.definition_id).eq("name", actor_name))?;
        let actor = actor.ok_or_else(|| ProcflowError::Definition(format!("actor '{}' is not deployed", actor_name)))?;
        fni.actor_id = Some(actor.id);
        Ok(())
    }

    /// Fails unless `user_id` may act on the user task `fni`.
    pub(super) fn check_actor(
        &self,
        fni: &FlowNodeInstance,
        user_id: UserId,
    ) -> Result<()> {
        if let Some(assignee) = fni.assignee_id {
            if assignee != user_id {
                return Err(ProcflowError::Execution(format!("user task {} is assigned to user {}", fni.id, assignee)));
            }
            return Ok(());
        }
        let actor_id = fni.actor_id.ok_or_else(|| ProcflowError::Execution(format!("user task {} has no actor", fni.id)))?;
        if !self.is_actor_member(fni.tenant_id, actor_id, user_id)? {
            return Err(ProcflowError::Execution(format!("user {} is not a member of actor {}", user_id, actor_id)));
        }
        Ok(())
    }

    pub(crate) fn is_actor_member(
        &self,
        tenant_id: TenantId,
        actor_id: u64,
        user_id: UserId,
    ) -> Result<bool> {
        let members: Vec<ActorMember> = self.store.list(tenant_id, &Query::new().eq("actor_id", actor_id))?;
        if members.is_empty() {
            return Ok(false);
        }
        let memberships = self.identity.memberships(tenant_id, user_id);
        Ok(members.iter().any(|m| match m.member {
            ActorMemberKind::User {
                user_id: member,
            } => member == user_id,
            ActorMemberKind::Group {
                group_id,
            } => memberships.iter().any(|ms| ms.group_id == group_id),
            ActorMemberKind::Role {
                role_id,
            } => memberships.iter().any(|ms| ms.role_id == role_id),
            ActorMemberKind::Membership {
                group_id,
                role_id,
            } => memberships.iter().any(|ms| ms.group_id == group_id && ms.role_id == role_id),
        }))
    }

    /// Evaluates `operations` over the process data, plus `extra` when given, and writes
    /// each result back into the process data.
    fn apply_operations(
        &self,
        fni: &FlowNodeInstance,
        operations: &[Operation],
        extra: Option<&Vars>,
    ) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        let mut context = self.process_data(fni.tenant_id, fni.process_instance_id)?;
        if let Some(extra) = extra {
            context.extend(extra);
        }
        for operation in operations {
            let value = self.evaluator.evaluate(&operation.expression, &context)?;
            let value = match operation.operator {
                Operator::Assign => value,
                Operator::Append => {
                    let mut items = match context.get_value(&operation.target) {
                        Some(Value::Array(items)) => items.clone(),
                        Some(Value::Null) | None => Vec::new(),
                        Some(other) => vec![other.clone()],
                    };
                    items.push(value);
                    Value::Array(items)
                }
            };
            self.set_process_data(fni.tenant_id, fni.process_instance_id, &operation.target, value.clone())?;
            context.set(&operation.target, value);
        }
        Ok(())
    }

    /// Writes mapped values of `payload` into the process data of `fni`. Sources are
    /// evaluated over the process data overlaid with the payload.
    fn apply_mappings(
        &self,
        fni: &FlowNodeInstance,
        mappings: &[DataMapping],
        payload: &Vars,
    ) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }
        let mut context = self.process_data(fni.tenant_id, fni.process_instance_id)?;
        context.extend(payload);
        for mapping in mappings {
            let value = self.evaluator.evaluate(&mapping.source, &context)?;
            self.set_process_data(fni.tenant_id, fni.process_instance_id, &mapping.target, value)?;
        }
        Ok(())
    }

    pub(super) fn map_data(
        &self,
        mappings: &[DataMapping],
        context: &Vars,
    ) -> Result<Vars> {
        let mut vars = Vars::new();
        for mapping in mappings {
            vars.set(&mapping.target, self.evaluator.evaluate(&mapping.source, context)?);
        }
        Ok(vars)
    }
}

fn take_trigger(stimulus: &mut Option<Stimulus>) -> Option<Vars> {
    if !matches!(stimulus, Some(Stimulus::Trigger(_))) {
        return None;
    }
    match stimulus.take() {
        Some(Stimulus::Trigger(payload)) => Some(payload),
        _ => None,
    }
}
