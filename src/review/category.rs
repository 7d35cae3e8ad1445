use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    Style,
    Mechanics,
    Clarity,
    Scope,
}

pub const REJECTION_CATEGORIES: [RejectionCategory; 4] = [
    RejectionCategory::Style,
    RejectionCategory::Mechanics,
    RejectionCategory::Clarity,
    RejectionCategory::Scope,
];

impl RejectionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionCategory::Style => "style",
            RejectionCategory::Mechanics => "mechanics",
            RejectionCategory::Clarity => "clarity",
            RejectionCategory::Scope => "scope",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "style" => Ok(RejectionCategory::Style),
            "mechanics" => Ok(RejectionCategory::Mechanics),
            "clarity" => Ok(RejectionCategory::Clarity),
            "scope" => Ok(RejectionCategory::Scope),
            other => Err(format!("unknown rejection category `{other}`")),
        }
    }
}

impl std::fmt::Display for RejectionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
