//! # System Constants
//!
//! Fixed values shared by the syndication pipeline: the ID-space layout,
//! dispatch defaults and the strings written into migrated rows.

/// ID-space layout of the shared target database
pub mod id_space {
    /// Rows with an id below this value were created locally in an environment.
    /// Anything at or above it arrived through syndication.
    pub const LOCAL_ID_THRESHOLD: i64 = 1_000_000_000;

    /// Gap between the id ranges of two consecutive source environments
    pub const DEFAULT_OFFSET_INCREMENT: i64 = 1_000_000_000;

    /// Offset applied to the first source environment
    pub const DEFAULT_BASE_OFFSET: i64 = 1_000_000_000;
}

/// Continuation queue dispatch defaults
pub mod dispatch {
    /// Delay used when a step does not specify one; long enough for a freshly
    /// started managed-database operation to register as the most recent one.
    pub const DEFAULT_DELAY_SECONDS: u64 = 30;

    /// Query parameter carrying the encoded resume context on GET dispatches
    pub const CONTEXT_QUERY_PARAM: &str = "context";
}

/// Values written into shared tables during the merge
pub mod migration {
    /// Replaces the password hash of every syndicated user
    pub const SYNDICATED_USER_PASSWORD: &str = "syndicated user, not allowed to login";
}

/// A source environment list consisting solely of this value means "none".
/// Deployment descriptors render a null list this way.
pub const NO_SOURCE_ENVIRONMENT_SENTINEL: &str = "None";

/// Emoji names used in progress messages
pub mod progress {
    pub const CHECK_MARK: &str = "heavy_check_mark";
    pub const CROSS_MARK: &str = "heavy_multiplication_x";
}
