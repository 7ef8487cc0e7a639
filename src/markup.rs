//! Decorative message markup and the metadata fields that go with it.
//!
//! Everything here is a pure function of its inputs. The fields land in
//! [`LogEvent`](crate::LogEvent) metadata and are never consulted by sampling, buffering or
//! delivery.

use std::fmt;
use std::str::FromStr;

use crate::event::Level;

pub const TASK_KIND_KEY: &str = "task.kind";
pub const TASK_NAME_KEY: &str = "task.name";
pub const RISK_KEY: &str = "risk.severity";
pub const ANOMALY_KEY: &str = "anomaly.kind";

/// Who a task is performed for or by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskKind {
    User,
    #[default]
    System,
    SystemUser,
    AdminUser,
    EndUser,
    ExternalUser,
    SystemInternal,
    SystemSecurity,
    SystemMaintenance,
    UserInitiatedSystemTask,
    SystemInitiatedUserTask,
}

impl TaskKind {
    pub const ALL: [TaskKind; 11] = [
        TaskKind::User,
        TaskKind::System,
        TaskKind::SystemUser,
        TaskKind::AdminUser,
        TaskKind::EndUser,
        TaskKind::ExternalUser,
        TaskKind::SystemInternal,
        TaskKind::SystemSecurity,
        TaskKind::SystemMaintenance,
        TaskKind::UserInitiatedSystemTask,
        TaskKind::SystemInitiatedUserTask,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::User => "User",
            TaskKind::System => "System",
            TaskKind::SystemUser => "SystemUser",
            TaskKind::AdminUser => "AdminUser",
            TaskKind::EndUser => "EndUser",
            TaskKind::ExternalUser => "ExternalUser",
            TaskKind::SystemInternal => "SystemInternal",
            TaskKind::SystemSecurity => "SystemSecurity",
            TaskKind::SystemMaintenance => "SystemMaintenance",
            TaskKind::UserInitiatedSystemTask => "UserInitiatedSystemTask",
            TaskKind::SystemInitiatedUserTask => "SystemInitiatedUserTask",
        }
    }

    /// Upper-case tag rendered in front of task messages, e.g. `SYSTEM_USER_TASK`.
    pub fn tag(self) -> &'static str {
        match self {
            TaskKind::User => "USER_TASK",
            TaskKind::System => "SYSTEM_TASK",
            TaskKind::SystemUser => "SYSTEM_USER_TASK",
            TaskKind::AdminUser => "ADMIN_USER_TASK",
            TaskKind::EndUser => "END_USER_TASK",
            TaskKind::ExternalUser => "EXTERNAL_USER_TASK",
            TaskKind::SystemInternal => "SYSTEM_INTERNAL_TASK",
            TaskKind::SystemSecurity => "SYSTEM_SECURITY_TASK",
            TaskKind::SystemMaintenance => "SYSTEM_MAINTENANCE_TASK",
            TaskKind::UserInitiatedSystemTask => "USER_INITIATED_SYSTEM_TASK",
            TaskKind::SystemInitiatedUserTask => "SYSTEM_INITIATED_USER_TASK",
        }
    }

    /// Parse a task kind name, falling back to [`TaskKind::System`] for unknown names.
    pub fn parse_lenient(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task kind: {0}")]
pub struct ParseTaskKindError(pub String);

impl FromStr for TaskKind {
    type Err = ParseTaskKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.name() == s || k.tag().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTaskKindError(s.to_string()))
    }
}

/// How serious a reported risk is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskSeverity {
    Minor,
    Normal,
    Critical,
}

impl RiskSeverity {
    /// Level a risk of this severity is emitted at.
    pub fn level(self) -> Level {
        match self {
            RiskSeverity::Minor => Level::Info,
            RiskSeverity::Normal => Level::Warning,
            RiskSeverity::Critical => Level::Critical,
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            RiskSeverity::Minor => "MINOR RISK",
            RiskSeverity::Normal => "RISK",
            RiskSeverity::Critical => "CRITICAL RISK",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RiskSeverity::Minor => "minor",
            RiskSeverity::Normal => "normal",
            RiskSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    Anomaly,
    Suspicious,
}

impl AnomalyKind {
    pub fn marker(self) -> &'static str {
        match self {
            AnomalyKind::Anomaly => "ANOMALY",
            AnomalyKind::Suspicious => "SUSPICIOUS",
        }
    }
}

pub fn task_fields(kind: TaskKind, task_name: &str) -> [(&'static str, String); 2] {
    [(TASK_KIND_KEY, kind.tag().to_string()), (TASK_NAME_KEY, task_name.to_string())]
}

pub fn risk_fields(severity: RiskSeverity) -> [(&'static str, String); 1] {
    [(RISK_KEY, severity.as_str().to_string())]
}

pub fn anomaly_fields(kind: AnomalyKind) -> [(&'static str, String); 1] {
    [(ANOMALY_KEY, kind.marker().to_ascii_lowercase())]
}

/// Wrap an identifier so it stands out in rendered text: `<# name #>`.
pub fn highlight(text: &str) -> String {
    format!("<# {text} #>")
}

/// Surround `message` with a `~MARKER~` pair.
pub fn bracket(marker: &str, message: &str) -> String {
    format!("~{marker}~ {message} ~{marker}~")
}

pub fn goal(text: &str) -> String {
    format!("<Goal: {text}>")
}

pub fn operator(text: &str) -> String {
    format!("<Op: {text}>")
}

pub fn method(text: &str) -> String {
    format!("<Method: {text}>")
}

/// `[TAG] message`, the rendered form of a task-scoped message.
pub fn task_message(kind: TaskKind, message: &str) -> String {
    format!("[{}] {message}", kind.tag())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_names_round_trip_and_fall_back() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.name().parse::<TaskKind>(), Ok(kind));
            assert_eq!(kind.tag().parse::<TaskKind>(), Ok(kind));
        }
        assert!("Wizard".parse::<TaskKind>().is_err());
        assert_eq!(TaskKind::parse_lenient("Wizard"), TaskKind::System);
    }

    #[test]
    fn risk_severity_maps_to_levels() {
        assert_eq!(RiskSeverity::Minor.level(), Level::Info);
        assert_eq!(RiskSeverity::Normal.level(), Level::Warning);
        assert_eq!(RiskSeverity::Critical.level(), Level::Critical);
        assert_eq!(bracket(RiskSeverity::Critical.marker(), "disk"), "~CRITICAL RISK~ disk ~CRITICAL RISK~");
    }

    #[test]
    fn field_helpers() {
        let fields = task_fields(TaskKind::SystemMaintenance, "vacuum");
        assert_eq!(fields[0], (TASK_KIND_KEY, "SYSTEM_MAINTENANCE_TASK".to_string()));
        assert_eq!(anomaly_fields(AnomalyKind::Suspicious)[0].1, "suspicious");
        assert_eq!(highlight("job-7"), "<# job-7 #>");
        assert_eq!(goal("ship"), "<Goal: ship>");
        assert_eq!(task_message(TaskKind::User, "hi"), "[USER_TASK] hi");
    }
}
