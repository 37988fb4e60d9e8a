//! URL-addressable conversation tokens.
//!
//! The portal routes to `/support/chat/<token>` where the token is either a
//! durable conversation id or the `new_<facilityId>` form for a facility
//! with no conversation yet. Parsing is infallible: anything without the
//! `new_` prefix is treated as a durable id and resolved against the store.

use carelink_shared::constants::ROUTE_NEW_PREFIX;
use carelink_shared::{ChatId, FacilityId};

/// A parsed conversation route token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRoute {
    /// Addresses an existing (or presumed existing) conversation.
    Durable(ChatId),
    /// Addresses a facility that may not have a conversation yet.
    NewFacility(FacilityId),
}

impl ChatRoute {
    pub fn parse(token: &str) -> Self {
        match token.strip_prefix(ROUTE_NEW_PREFIX) {
            Some(facility) => ChatRoute::NewFacility(FacilityId(facility.to_string())),
            None => ChatRoute::Durable(ChatId::durable(token)),
        }
    }

    /// Render back into a URL token.
    pub fn token(&self) -> String {
        match self {
            ChatRoute::Durable(id) => id.to_string(),
            ChatRoute::NewFacility(facility) => format!("{ROUTE_NEW_PREFIX}{facility}"),
        }
    }
}
