// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Time-Window Scheduler
// Decides once per tick whether the daily window calls for a connect or a disconnect

use std::time::Duration;

use chrono::NaiveTime;
use ssh_revtunnel_common::{format_time_of_day, ConnectionState, TunnelConfig};

/// Interval between schedule evaluations
pub const SCHEDULE_TICK: Duration = Duration::from_secs(60);

/// Shape of the daily window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// `connect < disconnect`, both on the same day
    SameDay,
    /// `connect > disconnect`, the window spans midnight
    Overnight,
    /// `connect == disconnect`; never acted upon
    Degenerate,
}

/// What the schedule asks the controller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Start,
    Stop,
}

/// Daily connect/disconnect window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub connect: NaiveTime,
    pub disconnect: NaiveTime,
}

impl ScheduleWindow {
    pub fn new(connect: NaiveTime, disconnect: NaiveTime) -> Self {
        Self {
            connect,
            disconnect,
        }
    }

    /// Window of the given config, or `None` when scheduling is disabled
    pub fn from_config(config: &TunnelConfig) -> Option<Self> {
        config
            .scheduled_connect
            .then(|| Self::new(config.connect_time, config.disconnect_time))
    }

    pub fn kind(&self) -> WindowKind {
        if self.connect < self.disconnect {
            WindowKind::SameDay
        } else if self.connect > self.disconnect {
            WindowKind::Overnight
        } else {
            WindowKind::Degenerate
        }
    }

    /// Whether `now` falls inside the connected part of the day
    pub fn contains(&self, now: NaiveTime) -> bool {
        match self.kind() {
            WindowKind::SameDay => self.connect <= now && now < self.disconnect,
            WindowKind::Overnight => now >= self.connect || now < self.disconnect,
            WindowKind::Degenerate => false,
        }
    }

    /// Action for the current time and connection state
    ///
    /// Only a Disconnected tunnel is started and only a Connected one is stopped;
    /// tunnels that are connecting or sitting in Error are left alone.
    pub fn evaluate(&self, now: NaiveTime, state: ConnectionState) -> Option<ScheduleAction> {
        if self.kind() == WindowKind::Degenerate {
            return None;
        }

        let inside = self.contains(now);
        match state {
            ConnectionState::Disconnected if inside => Some(ScheduleAction::Start),
            ConnectionState::Connected if !inside => Some(ScheduleAction::Stop),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        let kind = match self.kind() {
            WindowKind::SameDay => "same day",
            WindowKind::Overnight => "overnight",
            WindowKind::Degenerate => "empty",
        };
        format!(
            "{}-{} ({})",
            format_time_of_day(&self.connect),
            format_time_of_day(&self.disconnect),
            kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn test_same_day_window() {
        let window = ScheduleWindow::new(t(8, 0), t(22, 0));
        assert_eq!(window.kind(), WindowKind::SameDay);

        assert_eq!(
            window.evaluate(t(9, 0), ConnectionState::Disconnected),
            Some(ScheduleAction::Start)
        );
        assert_eq!(
            window.evaluate(t(23, 0), ConnectionState::Connected),
            Some(ScheduleAction::Stop)
        );
        assert_eq!(
            window.evaluate(t(7, 59), ConnectionState::Connected),
            Some(ScheduleAction::Stop)
        );

        // Already in the desired state
        assert_eq!(window.evaluate(t(9, 0), ConnectionState::Connected), None);
        assert_eq!(window.evaluate(t(23, 0), ConnectionState::Disconnected), None);
    }

    #[test]
    fn test_same_day_window_bounds() {
        let window = ScheduleWindow::new(t(8, 0), t(22, 0));
        assert!(window.contains(t(8, 0)));
        assert!(window.contains(t(21, 59)));
        assert!(!window.contains(t(22, 0)));
    }

    #[test]
    fn test_overnight_window() {
        let window = ScheduleWindow::new(t(22, 0), t(8, 0));
        assert_eq!(window.kind(), WindowKind::Overnight);

        assert_eq!(
            window.evaluate(t(23, 30), ConnectionState::Disconnected),
            Some(ScheduleAction::Start)
        );
        assert_eq!(
            window.evaluate(t(3, 0), ConnectionState::Disconnected),
            Some(ScheduleAction::Start)
        );
        assert_eq!(
            window.evaluate(t(9, 0), ConnectionState::Connected),
            Some(ScheduleAction::Stop)
        );
        assert_eq!(window.evaluate(t(23, 30), ConnectionState::Connected), None);
        // Midday lies outside 22:00-08:00, so a connected tunnel is stopped
        assert_eq!(
            window.evaluate(t(12, 0), ConnectionState::Connected),
            Some(ScheduleAction::Stop)
        );

        assert!(window.contains(t(22, 0)));
        assert!(window.contains(t(0, 0)));
        assert!(!window.contains(t(8, 0)));
    }

    #[test]
    fn test_transitional_states_are_left_alone() {
        let window = ScheduleWindow::new(t(8, 0), t(22, 0));
        for state in [ConnectionState::Connecting, ConnectionState::Error] {
            assert_eq!(window.evaluate(t(9, 0), state), None);
            assert_eq!(window.evaluate(t(23, 0), state), None);
        }
    }

    #[test]
    fn test_degenerate_window_never_acts() {
        let window = ScheduleWindow::new(t(8, 0), t(8, 0));
        assert_eq!(window.kind(), WindowKind::Degenerate);
        assert_eq!(window.evaluate(t(8, 0), ConnectionState::Disconnected), None);
        assert_eq!(window.evaluate(t(12, 0), ConnectionState::Disconnected), None);
        assert_eq!(window.evaluate(t(12, 0), ConnectionState::Connected), None);
    }

    #[test]
    fn test_from_config_respects_flag() {
        let mut config = TunnelConfig::default();
        assert!(ScheduleWindow::from_config(&config).is_none());

        config.scheduled_connect = true;
        let window = ScheduleWindow::from_config(&config).unwrap();
        assert_eq!(window.describe(), "08:00-22:00 (same day)");
    }
}
