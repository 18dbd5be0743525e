use std::fmt;

/// Entity collections the dashboard reads and subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Tasks,
    Boards,
    BoardGroups,
    Comments,
    Approvals,
    Activity,
}

impl Collection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Boards => "boards",
            Self::BoardGroups => "board_groups",
            Self::Comments => "comments",
            Self::Approvals => "approvals",
            Self::Activity => "activity",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Collection> for String {
    fn from(value: Collection) -> Self {
        value.as_str().to_string()
    }
}
