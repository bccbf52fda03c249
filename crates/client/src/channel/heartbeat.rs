// Heartbeat watchdog. Every ping counts as missed until a pong arrives; once
// `limit` pings in a row go unanswered the next tick asks for a reconnect.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    ForceReconnect,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    limit: u32,
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(limit: u32) -> Self {
        Self { limit: limit.max(1), missed: 0 }
    }

    pub fn on_tick(&mut self) -> HeartbeatAction {
        if self.missed >= self.limit {
            return HeartbeatAction::ForceReconnect;
        }
        self.missed += 1;
        HeartbeatAction::SendPing
    }

    pub fn on_ack(&mut self) {
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}
