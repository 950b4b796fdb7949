//! 事件发射辅助函数：先写结构化日志，再发布到注入的事件总线。

use crate::events::structured::{ConnectionEvent, Event, EventBus, HealthEvent, SelectionEvent};

use super::model::EndpointId;

pub fn emit_breaker_tripped(bus: &dyn EventBus, id: &EndpointId, consecutive_failures: u32) {
    tracing::warn!(
        target = "endpoint",
        endpoint = %id,
        consecutive_failures,
        "circuit breaker tripped"
    );
    bus.publish(Event::Health(HealthEvent::BreakerTripped {
        endpoint_id: id.to_string(),
        consecutive_failures,
    }));
}

pub fn emit_breaker_half_open(bus: &dyn EventBus, id: &EndpointId) {
    tracing::info!(target = "endpoint", endpoint = %id, "circuit breaker half-open after cooldown");
    bus.publish(Event::Health(HealthEvent::BreakerHalfOpen {
        endpoint_id: id.to_string(),
    }));
}

pub fn emit_breaker_closed(bus: &dyn EventBus, id: &EndpointId) {
    tracing::info!(target = "endpoint", endpoint = %id, "circuit breaker closed");
    bus.publish(Event::Health(HealthEvent::BreakerClosed {
        endpoint_id: id.to_string(),
    }));
}

pub fn emit_cache_pruned(bus: &dyn EventBus, probe_entries: usize, health_entries: usize) {
    tracing::debug!(target = "cache", probe_entries, health_entries, "cache maintenance pruned entries");
    bus.publish(Event::Health(HealthEvent::CachePruned {
        probe_entries,
        health_entries,
    }));
}

pub fn emit_batch_finished(
    bus: &dyn EventBus,
    selection_id: &str,
    tested: usize,
    succeeded: usize,
    skipped: usize,
    batches: usize,
    stopped_early: bool,
) {
    tracing::info!(
        target = "endpoint",
        selection_id,
        tested,
        succeeded,
        skipped,
        batches,
        stopped_early,
        "batch test finished"
    );
    bus.publish(Event::Selection(SelectionEvent::BatchFinished {
        id: selection_id.to_string(),
        tested,
        succeeded,
        skipped,
        batches,
        stopped_early,
    }));
}

pub fn emit_selection_completed(
    bus: &dyn EventBus,
    selection_id: &str,
    id: &EndpointId,
    score: f64,
    latency_ms: Option<u32>,
    candidates: usize,
    last_resort: bool,
) {
    tracing::info!(
        target = "endpoint",
        selection_id,
        endpoint = %id,
        score,
        latency_ms = ?latency_ms,
        candidates,
        last_resort,
        "endpoint selected"
    );
    bus.publish(Event::Selection(SelectionEvent::Completed {
        id: selection_id.to_string(),
        endpoint_id: id.to_string(),
        score,
        latency_ms,
        candidates,
        last_resort,
    }));
}

pub fn emit_selection_failed(bus: &dyn EventBus, selection_id: &str, reason: &str) {
    tracing::warn!(target = "endpoint", selection_id, reason, "endpoint selection failed");
    bus.publish(Event::Selection(SelectionEvent::Failed {
        id: selection_id.to_string(),
        reason: reason.to_string(),
    }));
}

pub fn emit_connect_succeeded(bus: &dyn EventBus, id: &EndpointId, attempts: u32, connect_ms: u64) {
    tracing::info!(target = "connect", endpoint = %id, attempts, connect_ms, "connection established");
    bus.publish(Event::Connection(ConnectionEvent::Succeeded {
        endpoint_id: id.to_string(),
        attempts,
        connect_ms,
    }));
}

pub fn emit_connect_failed(bus: &dyn EventBus, id: &EndpointId, category: &str, message: &str) {
    tracing::warn!(target = "connect", endpoint = %id, category, message, "connection failed");
    bus.publish(Event::Connection(ConnectionEvent::Failed {
        endpoint_id: id.to_string(),
        category: category.to_string(),
        message: message.to_string(),
    }));
}

pub fn emit_reconnect_started(bus: &dyn EventBus, cycle_id: &str) {
    tracing::info!(target = "connect", cycle_id, "auto-reconnection started");
    bus.publish(Event::Connection(ConnectionEvent::ReconnectStarted {
        id: cycle_id.to_string(),
    }));
}

pub fn emit_reconnect_strategy(bus: &dyn EventBus, cycle_id: &str, strategy: &str, step: u32) {
    tracing::info!(target = "connect", cycle_id, strategy, step, "reconnection strategy started");
    bus.publish(Event::Connection(ConnectionEvent::ReconnectStrategy {
        id: cycle_id.to_string(),
        strategy: strategy.to_string(),
        step,
    }));
}

pub fn emit_reconnect_finished(bus: &dyn EventBus, cycle_id: &str, success: bool, attempts: u32) {
    if success {
        tracing::info!(target = "connect", cycle_id, attempts, "auto-reconnection succeeded");
    } else {
        tracing::warn!(target = "connect", cycle_id, attempts, "auto-reconnection exhausted");
    }
    bus.publish(Event::Connection(ConnectionEvent::ReconnectFinished {
        id: cycle_id.to_string(),
        success,
        attempts,
    }));
}

pub fn emit_proactive_switch(bus: &dyn EventBus, from: &EndpointId, to: &EndpointId) {
    tracing::info!(target = "monitor", from = %from, to = %to, "proactive endpoint switch");
    bus.publish(Event::Connection(ConnectionEvent::ProactiveSwitch {
        from: from.to_string(),
        to: to.to_string(),
    }));
}

pub fn emit_manual_disconnect(bus: &dyn EventBus, suppressed_until_ms: i64) {
    tracing::info!(target = "connect", suppressed_until_ms, "manual disconnect, auto actions suppressed");
    bus.publish(Event::Connection(ConnectionEvent::ManualDisconnect { suppressed_until_ms }));
}
