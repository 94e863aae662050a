use tracing::debug;

use super::{FlowNodeExecutor, FlowNodeState, lifecycle::Scope};
use crate::{
    ProcflowError, Result, TenantId,
    engine::WorkKind,
    model::{FlowNodeDefinition, FlowNodeKind, FlowNodeType, TransitionDefinition},
    store::{
        Query,
        data::{FlowNodeInstance, ProcessInstance, ProcessState},
    },
    utils,
    workflow::ProcessGraph,
};

impl FlowNodeExecutor {
    /// Moves the token of a completed flow node along its selected outgoing transitions.
    pub(super) fn take_outgoing(
        &self,
        fni: &FlowNodeInstance,
        definition: &FlowNodeDefinition,
        graph: &ProcessGraph,
    ) -> Result<()> {
        let scope = Scope::from(fni);
        for transition in self.select_transitions(fni, definition, graph)? {
            self.reach(scope, transition, graph)?;
        }
        Ok(())
    }

    fn select_transitions<'g>(
        &self,
        fni: &FlowNodeInstance,
        definition: &FlowNodeDefinition,
        graph: &'g ProcessGraph,
    ) -> Result<Vec<&'g TransitionDefinition>> {
        let outgoing = graph.outgoing(&definition.id);
        if outgoing.iter().all(|t| t.condition.is_none()) && !definition.node_type().is_gateway() {
            return Ok(outgoing);
        }

        let context = self.process_data(fni.tenant_id, fni.process_instance_id)?;
        let (exclusive, default_transition) = match &definition.kind {
            FlowNodeKind::ExclusiveGateway {
                default_transition,
            } => (true, default_transition.as_deref()),
            FlowNodeKind::InclusiveGateway {
                default_transition,
            } => (false, default_transition.as_deref()),
            _ => (false, None),
        };

        let mut selected = Vec::new();
        for transition in outgoing.iter().filter(|t| Some(t.id.as_str()) != default_transition) {
            let taken = match &transition.condition {
                Some(condition) => self.evaluator.evaluate_bool(condition, &context)?,
                None => true,
            };
            if taken {
                selected.push(*transition);
                if exclusive {
                    break;
                }
            }
        }

        if selected.is_empty() && definition.node_type().is_gateway() {
            let fallback = default_transition.and_then(|id| graph.transition(id));
            match fallback {
                Some(transition) => selected.push(transition),
                None => {
                    return Err(ProcflowError::Execution(format!(
                        "no outgoing transition of gateway '{}' matched and no default is set",
                        definition.id
                    )));
                }
            }
        }
        Ok(selected)
    }

    /// Delivers a token to the target of `transition`. Parallel and inclusive gateways merge
    /// into a pending instance that this transition has not hit yet.
    fn reach(
        &self,
        scope: Scope,
        transition: &TransitionDefinition,
        graph: &ProcessGraph,
    ) -> Result<()> {
        let target = graph.flow_node(&transition.target)?;
        if matches!(target.node_type(), FlowNodeType::ParallelGateway | FlowNodeType::InclusiveGateway) {
            let pending: Vec<FlowNodeInstance> = self.store.list(
                scope.tenant_id,
                &Query::new().eq("process_instance_id", scope.process_instance_id).eq("flow_node_id", target.id.as_str()),
            )?;
            let merge = pending
                .into_iter()
                .find(|g| matches!(g.state, FlowNodeState::Initializing | FlowNodeState::Waiting) && !g.hit_bys.contains(&transition.id));
            // the gateway row is guarded by the process instance lock held by this transition
            if let Some(mut gateway) = merge {
                gateway.hit_bys.push(transition.id.clone());
                gateway.token_count += 1;
                gateway.last_update = utils::time::time_millis();
                self.recorder.update_entity(&gateway)?;
                debug!(flow_node_instance_id = gateway.id, transition = %transition.id, tokens = gateway.token_count, "token merged into gateway");
                return self.works.register(scope.tenant_id, WorkKind::ExecuteFlowNode {
                    flow_node_instance_id: gateway.id,
                });
            }
        }
        self.spawn_flow_node(scope, target, Some(&transition.id))?;
        Ok(())
    }

    /// Whether a gateway has received every token it waits for.
    pub(super) fn can_merge(
        &self,
        gateway: &FlowNodeInstance,
        graph: &ProcessGraph,
    ) -> Result<bool> {
        match gateway.kind {
            FlowNodeType::ParallelGateway => Ok(gateway.hit_bys.len() >= graph.incoming_count(&gateway.flow_node_id)),
            FlowNodeType::InclusiveGateway => {
                let others: Vec<FlowNodeInstance> = self.store.list(
                    gateway.tenant_id,
                    &Query::new().eq("process_instance_id", gateway.process_instance_id).ne("flow_node_id", gateway.flow_node_id.as_str()),
                )?;
                Ok(!others.iter().any(|other| graph.can_reach(&other.flow_node_id, &gateway.flow_node_id)))
            }
            _ => Ok(true),
        }
    }

    /// Wakes inclusive gateways that may now merge, and completes the process once no
    /// flow node is left.
    pub(super) fn after_flow_node_removed(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
        graph: &ProcessGraph,
    ) -> Result<()> {
        let remaining: Vec<FlowNodeInstance> = self.store.list(tenant_id, &Query::new().eq("process_instance_id", process_instance_id))?;
        if remaining.is_empty() {
            let Some(pi) = self.store.find::<ProcessInstance>(tenant_id, process_instance_id)? else {
                return Ok(());
            };
            if !pi.state.is_terminal() {
                self.finish_process(pi, ProcessState::Completed)?;
            }
            return Ok(());
        }
        for gateway in remaining.iter().filter(|f| f.kind == FlowNodeType::InclusiveGateway && f.state == FlowNodeState::Waiting) {
            if self.can_merge(gateway, graph)? {
                self.works.register(tenant_id, WorkKind::ExecuteFlowNode {
                    flow_node_instance_id: gateway.id,
                })?;
            }
        }
        Ok(())
    }
}
