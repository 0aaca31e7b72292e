//! Recognized header keys.
//!
//! | Key | Set by | Present when |
//! |---|---|---|
//! | `MessageName` | sender | always |
//! | `MessageFullName` | sender | always |
//! | `TimeSent` | sender | always, fresh per call |
//! | `Destination` | sender | point-to-point only |
//! | `SendingHost` | sender | host name could be resolved |
//! | `Error` | bus | forwarded to an error endpoint |

/// Short type name of the payload.
pub const MESSAGE_NAME: &str = "MessageName";
/// Fully-qualified type name of the payload.
pub const MESSAGE_FULL_NAME: &str = "MessageFullName";
/// Send timestamp, formatted with [`TIME_SENT_FORMAT`].
pub const TIME_SENT: &str = "TimeSent";
/// Intended recipient endpoint.
pub const DESTINATION: &str = "Destination";
/// Originating host name.
pub const SENDING_HOST: &str = "SendingHost";
/// Human-readable failure description.
pub const ERROR: &str = "Error";

/// `chrono` format for the [`TIME_SENT`] header, microsecond precision.
pub const TIME_SENT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
