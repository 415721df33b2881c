use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::call::{ActiveCall, CallState, CallStats, EndReason};
use crate::error::{CallOpError, RoutingFailure};
use crate::types::{AgentId, CallId, SocketId, VisitorId};

/// How long an ended call keeps answering late events with `AlreadyResolved`
const ENDED_RETENTION: Duration = Duration::from_secs(600);

/// Most ended calls remembered at once
const ENDED_CAPACITY: usize = 10_000;

/// Who took part in a call that has left the arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EndedCall {
    pub(crate) visitor_id: VisitorId,
    pub(crate) agent_id: Option<AgentId>,
    pub(crate) reason: EndReason,
    ended_at: Instant,
}

impl EndedCall {
    pub(crate) fn involves_agent(&self, agent_id: &AgentId) -> bool {
        self.agent_id.as_ref() == Some(agent_id)
    }
}

/// Arena of live calls with visitor and agent indexes
///
/// Every state transition goes through a method here, and the pool manager
/// holds the registry lock only for the duration of one such call. That
/// makes the registry the single arbiter: whichever event reaches it first
/// wins and later ones see `AlreadyResolved`. Ended calls leave the arena
/// but their ids are remembered for a while, so a late accept, reject or
/// hang-up still sees `AlreadyResolved` rather than `NotFound`.
#[derive(Debug, Default)]
pub(crate) struct CallRegistry {
    calls: HashMap<CallId, ActiveCall>,
    by_visitor: HashMap<VisitorId, CallId>,
    by_agent: HashMap<AgentId, CallId>,
    ended: HashMap<CallId, EndedCall>,
    ended_order: VecDeque<CallId>,
}

impl CallRegistry {
    pub(crate) fn insert(&mut self, call: ActiveCall) -> Result<(), RoutingFailure> {
        if self.by_visitor.contains_key(&call.visitor_id) {
            return Err(RoutingFailure::AlreadyInCall);
        }
        self.by_visitor.insert(call.visitor_id.clone(), call.call_id.clone());
        self.calls.insert(call.call_id.clone(), call);
        Ok(())
    }

    pub(crate) fn get(&self, call_id: &CallId) -> Option<&ActiveCall> {
        self.calls.get(call_id)
    }

    pub(crate) fn by_visitor(&self, visitor_id: &VisitorId) -> Option<&ActiveCall> {
        self.by_visitor.get(visitor_id).and_then(|id| self.calls.get(id))
    }

    pub(crate) fn by_agent(&self, agent_id: &AgentId) -> Option<&ActiveCall> {
        self.by_agent.get(agent_id).and_then(|id| self.calls.get(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    pub(crate) fn call_ids(&self) -> Vec<CallId> {
        self.calls.keys().cloned().collect()
    }

    /// A call that ended recently, if `call_id` is one
    pub(crate) fn recently_ended(&self, call_id: &CallId) -> Option<&EndedCall> {
        self.ended
            .get(call_id)
            .filter(|ended| ended.ended_at.elapsed() < ENDED_RETENTION)
    }

    fn missing(&self, call_id: &CallId) -> CallOpError {
        if self.recently_ended(call_id).is_some() {
            CallOpError::AlreadyResolved
        } else {
            CallOpError::NotFound
        }
    }

    fn call_mut(&mut self, call_id: &CallId) -> Result<&mut ActiveCall, CallOpError> {
        if !self.calls.contains_key(call_id) {
            return Err(self.missing(call_id));
        }
        self.calls.get_mut(call_id).ok_or(CallOpError::NotFound)
    }

    fn remember_ended(&mut self, call: &ActiveCall, reason: EndReason) {
        let now = Instant::now();
        while let Some(oldest) = self.ended_order.front() {
            let expired = self
                .ended
                .get(oldest)
                .map_or(true, |ended| now.duration_since(ended.ended_at) >= ENDED_RETENTION);
            if !expired && self.ended_order.len() < ENDED_CAPACITY {
                break;
            }
            if let Some(oldest) = self.ended_order.pop_front() {
                self.ended.remove(&oldest);
            }
        }
        self.ended.insert(
            call.call_id.clone(),
            EndedCall {
                visitor_id: call.visitor_id.clone(),
                agent_id: call.agent_id.clone(),
                reason,
                ended_at: now,
            },
        );
        self.ended_order.push_back(call.call_id.clone());
    }

    pub(crate) fn ended_len(&self) -> usize {
        self.ended.len()
    }

    /// pending -> ringing for `agent_id`
    pub(crate) fn begin_ringing(&mut self, call_id: &CallId, agent_id: &AgentId) -> Result<ActiveCall, CallOpError> {
        if self.by_agent.get(agent_id).is_some_and(|id| id != call_id) {
            return Err(CallOpError::AlreadyResolved);
        }
        let call = self.call_mut(call_id)?;
        if !call.state.can_transition_to(CallState::Ringing) {
            return Err(CallOpError::AlreadyResolved);
        }
        call.state = CallState::Ringing;
        call.agent_id = Some(agent_id.clone());
        call.ring_started_at = Some(Utc::now());
        let snapshot = call.clone();
        self.by_agent.insert(agent_id.clone(), call_id.clone());
        Ok(snapshot)
    }

    /// ringing -> pending, recording that `agent_id` declined or missed it
    pub(crate) fn return_to_pending(&mut self, call_id: &CallId, agent_id: &AgentId) -> Result<ActiveCall, CallOpError> {
        let call = self.call_mut(call_id)?;
        if call.state != CallState::Ringing || !call.is_assigned_to(agent_id) {
            return Err(CallOpError::AlreadyResolved);
        }
        call.state = CallState::Pending;
        call.agent_id = None;
        call.ring_started_at = None;
        if !call.declined_agents.contains(agent_id) {
            call.declined_agents.push(agent_id.clone());
        }
        let snapshot = call.clone();
        self.by_agent.remove(agent_id);
        Ok(snapshot)
    }

    /// ringing -> accepted by the agent it is ringing for
    pub(crate) fn accept(&mut self, call_id: &CallId, agent_id: &AgentId, token: String) -> Result<ActiveCall, CallOpError> {
        let call = self.call_mut(call_id)?;
        if call.state != CallState::Ringing || !call.is_assigned_to(agent_id) {
            return Err(CallOpError::AlreadyResolved);
        }
        call.state = CallState::Accepted;
        call.answered_at = Some(Utc::now());
        call.reconnect_token = Some(token);
        Ok(call.clone())
    }

    /// accepted -> active
    pub(crate) fn media_connected(&mut self, call_id: &CallId) -> Result<ActiveCall, CallOpError> {
        let call = self.call_mut(call_id)?;
        if call.state != CallState::Accepted {
            return Err(CallOpError::AlreadyResolved);
        }
        call.state = CallState::Active;
        call.connected_at = Some(Utc::now());
        Ok(call.clone())
    }

    /// active -> waiting_for_reconnection, only if the drop came from the
    /// socket the call knows about
    pub(crate) fn await_reconnection(&mut self, call_id: &CallId, socket_id: &SocketId) -> Result<ActiveCall, CallOpError> {
        let call = self.call_mut(call_id)?;
        if call.state != CallState::Active || &call.visitor_socket_id != socket_id {
            return Err(CallOpError::AlreadyResolved);
        }
        call.state = CallState::WaitingForReconnection;
        Ok(call.clone())
    }

    /// Token presented on rejoin matches the one issued for this call
    pub(crate) fn rejoin_allowed(&self, call_id: &CallId, visitor_id: &VisitorId, token: &str) -> bool {
        self.calls.get(call_id).is_some_and(|call| {
            call.state == CallState::WaitingForReconnection
                && &call.visitor_id == visitor_id
                && call.reconnect_token.as_deref() == Some(token)
        })
    }

    /// waiting_for_reconnection -> active on a new socket with a rotated token
    pub(crate) fn resume(
        &mut self,
        call_id: &CallId,
        socket_id: &SocketId,
        token: String,
    ) -> Result<ActiveCall, CallOpError> {
        let call = self.call_mut(call_id)?;
        if call.state != CallState::WaitingForReconnection {
            return Err(CallOpError::AlreadyResolved);
        }
        call.state = CallState::Active;
        call.visitor_socket_id = socket_id.clone();
        call.reconnect_token = Some(token);
        Ok(call.clone())
    }

    /// Move a call to ended and drop it from the arena, if `allowed` agrees.
    /// Returns the final record and the state it ended from.
    pub(crate) fn finish_if(
        &mut self,
        call_id: &CallId,
        reason: EndReason,
        allowed: impl FnOnce(&ActiveCall) -> bool,
    ) -> Result<(ActiveCall, CallState), CallOpError> {
        let Some(call) = self.calls.get(call_id) else {
            return Err(self.missing(call_id));
        };
        if call.is_ended() || !allowed(call) {
            return Err(CallOpError::AlreadyResolved);
        }
        let mut call = self.calls.remove(call_id).ok_or(CallOpError::NotFound)?;
        let previous = call.state;
        call.state = CallState::Ended;
        call.ended_at = Some(Utc::now());
        call.end_reason = Some(reason);

        if self.by_visitor.get(&call.visitor_id) == Some(call_id) {
            self.by_visitor.remove(&call.visitor_id);
        }
        if let Some(agent_id) = &call.agent_id {
            if self.by_agent.get(agent_id) == Some(call_id) {
                self.by_agent.remove(agent_id);
            }
        }
        self.remember_ended(&call, reason);
        Ok((call, previous))
    }

    pub(crate) fn stats(&self) -> CallStats {
        let mut stats = CallStats::default();
        for call in self.calls.values() {
            match call.state {
                CallState::Pending => stats.pending += 1,
                CallState::Ringing => stats.ringing += 1,
                CallState::Accepted => stats.accepted += 1,
                CallState::Active => stats.active += 1,
                CallState::WaitingForReconnection => stats.waiting_for_reconnection += 1,
                CallState::Ended => {}
            }
        }
        stats
    }
}
