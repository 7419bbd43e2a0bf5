//! Protocol adapters to and from the canonical action. Each adapter offers
//! the same capability pair: normalize an inbound protocol message into a
//! `CanonicalAction`, and denormalize an interception outcome back into the
//! protocol's own response shape.

pub mod http;
pub mod mcp;
