use std::time::Duration;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected: before the first connect, after `close`, or the moment
    /// a live link drops.
    Disconnected,
    Connected { generation: u64 },
    /// Background reconnect in progress. `remaining` excludes this attempt.
    Reconnecting { attempt: u32, remaining: u32 },
    /// Retry budget spent. Terminal.
    Abandoned,
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned)
    }
}

/// Fixed-interval, bounded reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// State to publish before attempt number `attempt` (1-based), or `None`
    /// once the budget is spent.
    pub fn step(&self, attempt: u32) -> Option<ChannelState> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(ChannelState::Reconnecting {
            attempt,
            remaining: self.max_attempts - attempt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_counts_down() {
        let policy = ReconnectPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
        };
        let states: Vec<_> = (1..).map_while(|n| policy.step(n)).collect();
        assert_eq!(
            states,
            vec![
                ChannelState::Reconnecting { attempt: 1, remaining: 2 },
                ChannelState::Reconnecting { attempt: 2, remaining: 1 },
                ChannelState::Reconnecting { attempt: 3, remaining: 0 },
            ]
        );
        assert_eq!(policy.step(4), None);
    }

    #[test]
    fn zero_budget_abandons_immediately() {
        let policy = ReconnectPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 0,
        };
        assert_eq!(policy.step(1), None);
    }
}
