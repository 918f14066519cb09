//! OAuth flow: signed state tokens, code exchange, token extension, and
//! account binding.
//!
//! Flow errors are returned straight to the caller for redirect/display.
//! They never touch job or integration state.

mod flow;
mod state;

pub use flow::{OAuthFlow, TokenGrant, INITIAL_BACKFILL_TIMEFRAME_DAYS};
pub use state::{create_state, validate_state, StatePayload, STATE_TTL_SECS};
