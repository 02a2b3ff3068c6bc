//! Agent roles applied to milestones.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Specialization applied to a milestone.
///
/// The engine dispatches on this with an exhaustive `match`, so adding a role
/// means adding its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Pm,
    Ba,
    Ux,
    Arch,
    Dev,
    Qa,
    Doc,
}

/// Title keywords per role, checked in this order. A keyword matches when a
/// word of the title starts with it.
const KEYWORDS: [(AgentRole, &[&str]); 7] = [
    (AgentRole::Pm, &["plan", "manage"]),
    (AgentRole::Ba, &["requirement", "analyze", "analysis"]),
    (AgentRole::Ux, &["design", "ui", "ux"]),
    (AgentRole::Arch, &["architecture", "architect"]),
    (AgentRole::Dev, &["code", "implement", "develop"]),
    (AgentRole::Qa, &["test", "qa", "quality"]),
    (AgentRole::Doc, &["document", "doc", "readme"]),
];

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::Pm,
        AgentRole::Ba,
        AgentRole::Ux,
        AgentRole::Arch,
        AgentRole::Dev,
        AgentRole::Qa,
        AgentRole::Doc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Pm => "pm",
            AgentRole::Ba => "ba",
            AgentRole::Ux => "ux",
            AgentRole::Arch => "arch",
            AgentRole::Dev => "dev",
            AgentRole::Qa => "qa",
            AgentRole::Doc => "doc",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AgentRole::Pm => "Project Manager",
            AgentRole::Ba => "Business Analyst",
            AgentRole::Ux => "UX Designer",
            AgentRole::Arch => "Software Architect",
            AgentRole::Dev => "Developer",
            AgentRole::Qa => "QA Engineer",
            AgentRole::Doc => "Technical Writer",
        }
    }

    /// Roles whose replies may carry file contents as fenced code blocks.
    pub fn produces_files(self) -> bool {
        matches!(self, AgentRole::Dev | AgentRole::Doc | AgentRole::Arch)
    }

    /// Infer a role from a milestone title, defaulting to [`AgentRole::Dev`].
    pub fn infer_from_title(title: &str) -> AgentRole {
        let lowered = title.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        KEYWORDS
            .iter()
            .find(|(_, keywords)| {
                keywords
                    .iter()
                    .any(|kw| words.iter().any(|word| word.starts_with(kw)))
            })
            .map(|(role, _)| *role)
            .unwrap_or(AgentRole::Dev)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let role = match s.trim().to_lowercase().as_str() {
            "pm" | "project_manager" | "manager" => AgentRole::Pm,
            "ba" | "business_analyst" | "analyst" => AgentRole::Ba,
            "ux" | "ui" | "designer" => AgentRole::Ux,
            "arch" | "architect" => AgentRole::Arch,
            "dev" | "developer" => AgentRole::Dev,
            "qa" | "tester" => AgentRole::Qa,
            "doc" | "docs" | "writer" => AgentRole::Doc,
            other => return Err(format!("unknown agent role '{other}'")),
        };
        Ok(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_roles_from_title_keywords() {
        let cases = [
            ("Plan the release", AgentRole::Pm),
            ("Requirements Analysis", AgentRole::Ba),
            ("Design the login screen", AgentRole::Ux),
            ("Architecture review", AgentRole::Arch),
            ("Implement X", AgentRole::Dev),
            ("Testing", AgentRole::Qa),
            ("Write documentation", AgentRole::Doc),
            ("Refactor storage", AgentRole::Dev),
        ];
        for (title, role) in cases {
            assert_eq!(AgentRole::infer_from_title(title), role, "{title}");
        }
    }

    #[test]
    fn keyword_must_start_a_word() {
        // "build" contains "ui" but is not a UX milestone.
        assert_eq!(AgentRole::infer_from_title("Build the API"), AgentRole::Dev);
    }

    #[test]
    fn earlier_roles_win_on_ties() {
        assert_eq!(AgentRole::infer_from_title("Implement tests"), AgentRole::Dev);
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("Developer".parse::<AgentRole>(), Ok(AgentRole::Dev));
        assert_eq!("arch".parse::<AgentRole>(), Ok(AgentRole::Arch));
        assert!("chef".parse::<AgentRole>().is_err());
    }
}
