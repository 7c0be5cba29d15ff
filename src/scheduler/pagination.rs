//! Offset cursors for job listings.
//!
//! A page token is the URL-safe base64 encoding of `{"offset": N}`. Tokens
//! are opaque to callers, and a token that fails to decode resolves to the
//! first page instead of an error.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub offset: usize,
}

impl PageToken {
    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub fn encode(&self) -> String {
        // Serializing a struct with one integer field cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a token, returning `None` for anything malformed.
    pub fn decode(token: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(token.trim().trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Offset to start from; missing and malformed tokens both mean zero.
    pub fn resolve_offset(token: Option<&str>) -> usize {
        token.and_then(Self::decode).map_or(0, |t| t.offset)
    }
}

/// Clamps a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Pagination block of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub limit: usize,
    pub total_items: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl Pagination {
    /// Builds the block for a page starting at `offset`.
    ///
    /// No next token is issued once `offset + limit` reaches the total.
    pub fn new(offset: usize, limit: usize, total_items: usize) -> Self {
        let end = offset.saturating_add(limit);
        let next_page_token = (end < total_items).then(|| PageToken::new(end).encode());
        Self {
            limit,
            total_items,
            next_page_token,
        }
    }
}
