//! Operation categories.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TollgateError;

/// A class of operation with its own quota policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Login attempts
    Authentication,
    /// Account creation
    Registration,
    ApiRead,
    ApiWrite,
    ApiDelete,
    /// File and image uploads
    Upload,
    /// Anonymous browsing of public collections
    PublicView,
    /// Routes without a more specific category
    Default,
}

impl Category {
    /// Number of categories.
    pub const COUNT: usize = 8;

    /// Every category, in a stable order.
    pub const ALL: [Category; Category::COUNT] = [
        Category::Authentication,
        Category::Registration,
        Category::ApiRead,
        Category::ApiWrite,
        Category::ApiDelete,
        Category::Upload,
        Category::PublicView,
        Category::Default,
    ];

    /// The snake_case name used on the wire and in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Authentication => "authentication",
            Category::Registration => "registration",
            Category::ApiRead => "api_read",
            Category::ApiWrite => "api_write",
            Category::ApiDelete => "api_delete",
            Category::Upload => "upload",
            Category::PublicView => "public_view",
            Category::Default => "default",
        }
    }

    /// Position in [`Category::ALL`], used to index per-category counters.
    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| TollgateError::UnknownCategory(name.to_string()))
    }
}
