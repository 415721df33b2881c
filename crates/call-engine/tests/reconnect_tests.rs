//! Transport drops, reconnection windows and rejoin

mod common;

use common::*;
use greetnow_call_engine::prelude::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

/// An agent and visitor in an active call
async fn active_call(h: &mut Harness) -> (AgentId, VisitorId, SocketId, ActiveCall) {
    let (agent, _) = h.agent("alice", &[SALES]).await;
    let (visitor, visitor_socket) = h.visitor("v1", HOME_URL).await;
    let request = h.manager.request_call(&visitor, None).await.unwrap();
    h.manager.accept_call(&request.call_id, &agent).await.unwrap();
    let call = h.manager.mark_media_connected(&request.call_id).unwrap();
    h.drain();
    (agent, visitor, visitor_socket, call)
}

#[tokio::test(start_paused = true)]
async fn visitor_rejoins_within_the_window() {
    let mut h = Harness::new().await;
    let (agent, visitor, old_socket, call) = active_call(&mut h).await;
    let token = call.reconnect_token.clone().unwrap();

    h.manager.visitor_disconnected(&visitor, &old_socket).await;
    let waiting = h.manager.get_call(&call.call_id).unwrap();
    assert_eq!(waiting.state, CallState::WaitingForReconnection);
    assert!(h.manager.reconnect_windows().is_waiting(&call.call_id));

    let messages = h.drain();
    assert_eq!(
        agent_events(&messages, &agent),
        vec![&AgentEvent::CallReconnecting {
            call_id: call.call_id.clone(),
            message: "Visitor connection lost, waiting for them to reconnect".to_string(),
            timeout_seconds: 60,
        }]
    );

    tokio::time::sleep(Duration::from_secs(40)).await;
    let new_socket = SocketId::from("sock-v1-again");
    assert!(h.manager.rejoin_visitor(&visitor, &new_socket, &token).await);

    let resumed = h.manager.get_call(&call.call_id).unwrap();
    assert_eq!(resumed.state, CallState::Active);
    assert_eq!(resumed.visitor_socket_id, new_socket);
    let rotated = resumed.reconnect_token.clone().unwrap();
    assert_ne!(rotated, token);
    assert_eq!(h.manager.get_visitor(&visitor).await.unwrap().socket_id, new_socket);

    let messages = h.drain();
    assert!(messages.iter().any(|m| matches!(
        m,
        OutboundMessage::Visitor { socket_id, event: VisitorEvent::Reconnected { reconnect_token, .. }, .. }
            if socket_id == &new_socket && reconnect_token == &rotated
    )));
    assert!(agent_events(&messages, &agent)
        .iter()
        .any(|e| matches!(e, AgentEvent::CallReconnected { .. })));

    // The cancelled window never fires
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.manager.get_call(&call.call_id).unwrap().state, CallState::Active);

    // A late close of the old socket is stale
    h.manager.visitor_disconnected(&visitor, &old_socket).await;
    assert_eq!(h.manager.get_call(&call.call_id).unwrap().state, CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn window_expiry_ends_the_call_and_frees_the_agent() {
    let mut h = Harness::new().await;
    let (agent, visitor, socket, call) = active_call(&mut h).await;

    h.manager.visitor_disconnected(&visitor, &socket).await;
    h.drain();

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(h.manager.get_call(&call.call_id).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;

    assert!(h.manager.get_call(&call.call_id).is_none());
    assert!(h.manager.reconnect_windows().is_empty());
    assert!(h.manager.get_visitor(&visitor).await.is_none());
    assert_eq!(h.manager.get_agent(&agent).await.unwrap().status, AgentStatus::Idle);

    let messages = h.drain();
    assert_eq!(
        agent_events(&messages, &agent),
        vec![&AgentEvent::CallEnded {
            call_id: call.call_id.clone(),
            reason: EndReason::ReconnectFailed
        }]
    );

    // Too late: nothing to rejoin
    let token = call.reconnect_token.unwrap();
    assert!(!h.manager.rejoin_visitor(&visitor, &SocketId::from("late"), &token).await);
}

#[tokio::test(start_paused = true)]
async fn rejoin_with_wrong_token_or_visitor_is_refused() {
    let mut h = Harness::new().await;
    let (_agent, visitor, socket, call) = active_call(&mut h).await;
    let token = call.reconnect_token.clone().unwrap();
    h.manager.visitor_disconnected(&visitor, &socket).await;

    let new_socket = SocketId::from("sock-new");
    assert!(!h.manager.handle_rejoin(&call.call_id, &visitor, &new_socket, "stale-token").await);
    assert!(
        !h.manager
            .handle_rejoin(&call.call_id, &VisitorId::from("intruder"), &new_socket, &token)
            .await
    );
    assert!(!h.manager.handle_rejoin(&CallId::from("other"), &visitor, &new_socket, &token).await);

    // Refusals leave the window running
    assert!(h.manager.reconnect_windows().is_waiting(&call.call_id));
    assert!(h.manager.handle_rejoin(&call.call_id, &visitor, &new_socket, &token).await);
}

#[tokio::test]
async fn agent_drop_ends_the_call() {
    let mut h = Harness::new().await;
    let (agent, visitor, _, call) = active_call(&mut h).await;

    h.manager
        .agent_disconnected(&agent, &SocketId::from("sock-alice"))
        .await;

    assert!(h.manager.get_call(&call.call_id).is_none());
    let state = h.manager.get_agent(&agent).await.unwrap();
    assert_eq!(state.status, AgentStatus::Offline);
    assert!(!state.is_connected());

    // Nobody else is online to take over the greeting
    let messages = h.drain();
    assert_eq!(
        visitor_events(&messages, &visitor),
        vec![
            &VisitorEvent::CallEnded {
                call_id: call.call_id.clone(),
                reason: EndReason::AgentDisconnected
            },
            &VisitorEvent::AgentUnavailable {
                call_id: None,
                reason: "agent_offline".to_string()
            }
        ]
    );
    assert_eq!(h.manager.get_visitor(&visitor).await.unwrap().assigned_agent_id, None);
}

#[tokio::test]
async fn stale_agent_disconnect_is_ignored() {
    let h = Harness::new().await;
    let (agent, _) = h.agent("alice", &[SALES]).await;
    // Second tab replaces the socket
    h.manager
        .register_agent(&agent, &SocketId::from("sock-tab-2"), AgentProfile::new("alice", ORG, "ALICE"))
        .await;

    h.manager.agent_disconnected(&agent, &SocketId::from("sock-alice")).await;
    let state = h.manager.get_agent(&agent).await.unwrap();
    assert!(state.is_connected());
    assert_eq!(state.status, AgentStatus::Idle);
}

#[tokio::test]
async fn visitor_drop_while_ringing_cancels_the_offer() {
    let mut h = Harness::new().await;
    let (agent, _) = h.agent("alice", &[SALES]).await;
    let (visitor, socket) = h.visitor("v1", HOME_URL).await;
    let request = h.manager.request_call(&visitor, None).await.unwrap();
    h.drain();

    h.manager.visitor_disconnected(&visitor, &socket).await;

    assert!(h.manager.get_call(&request.call_id).is_none());
    assert!(h.manager.get_visitor(&visitor).await.is_none());
    let messages = h.drain();
    assert_eq!(
        agent_events(&messages, &agent),
        vec![&AgentEvent::CallCancelled {
            call_id: request.call_id.clone(),
            reason: EndReason::VisitorCancelled
        }]
    );
}

#[tokio::test]
async fn visitor_drop_before_media_ends_the_call() {
    let h = Harness::new().await;
    let (agent, _) = h.agent("alice", &[SALES]).await;
    let (visitor, socket) = h.visitor("v1", HOME_URL).await;
    let request = h.manager.request_call(&visitor, None).await.unwrap();
    h.manager.accept_call(&request.call_id, &agent).await.unwrap();

    h.manager.visitor_disconnected(&visitor, &socket).await;

    assert!(h.manager.get_call(&request.call_id).is_none());
    assert!(h.manager.reconnect_windows().is_empty());
    assert_eq!(h.manager.get_agent(&agent).await.unwrap().status, AgentStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn agent_keeps_status_across_a_short_drop() {
    let h = Harness::new().await;
    let (agent, socket) = h.agent("alice", &[SALES]).await;
    h.manager.set_agent_status(&agent, AgentStatus::Away).await.unwrap();

    h.manager.agent_disconnected(&agent, &socket).await;
    let back = h
        .manager
        .register_agent(&agent, &SocketId::from("sock-alice-2"), AgentProfile::new("alice", ORG, "ALICE"))
        .await;
    assert_eq!(back.status, AgentStatus::Away);
    assert!(back.is_connected());
}

#[tokio::test]
async fn purge_drops_agents_past_grace() {
    let (notifier, _outbound) = ChannelNotifier::new();
    let mut calls = CallsConfig::default();
    calls.agent_grace_secs = 0;
    let manager = PoolManagerBuilder::new()
        .with_config(calls)
        .with_notifier(std::sync::Arc::new(notifier))
        .build()
        .unwrap();

    let agent = AgentId::from("alice");
    let socket = SocketId::from("sock-alice");
    manager
        .register_agent(&agent, &socket, AgentProfile::new("alice", ORG, "ALICE"))
        .await;
    manager.agent_disconnected(&agent, &socket).await;

    assert_eq!(manager.purge_disconnected_agents().await, vec![agent.clone()]);
    assert!(manager.get_agent(&agent).await.is_none());
}
