//! Decrypting feed iterators over queries and the change feed.

use coffer_storage::{ChangeFeedMode, ChangeFeedStart, FeedResponse, QueryDefinition, StatusCode};
use tracing::debug;

use crate::container::EncryptionContainer;
use crate::decryptable::DecryptableItem;
use crate::error::ContainerError;

enum Source {
    Query {
        query: QueryDefinition,
        continuation: Option<String>,
    },
    ChangeFeed(ChangeFeedStart),
}

/// One page of lazily decrypted items.
#[derive(Debug)]
pub struct DecryptableFeedResponse {
    /// Page status.
    pub status: StatusCode,
    /// Items, still encrypted.
    pub items: Vec<DecryptableItem>,
    /// Token to resume after this page.
    pub continuation_token: Option<String>,
    /// Cost of the page.
    pub request_charge: f64,
}

/// Pages through a query or a change feed, decrypting every page.
///
/// A query iterator is done once the store stops returning a continuation
/// token; later reads return empty pages. A change feed iterator reports no
/// more results once it has caught up, but can be read again to pick up
/// new writes.
pub struct EncryptionFeedIterator {
    container: EncryptionContainer,
    source: Source,
    max_item_count: usize,
    has_more_results: bool,
}

impl EncryptionFeedIterator {
    pub(crate) fn query(
        container: EncryptionContainer,
        query: QueryDefinition,
        max_item_count: usize,
    ) -> Self {
        Self {
            container,
            source: Source::Query {
                query,
                continuation: None,
            },
            max_item_count,
            has_more_results: true,
        }
    }

    pub(crate) fn change_feed(
        container: EncryptionContainer,
        start: ChangeFeedStart,
        max_item_count: usize,
    ) -> Self {
        Self {
            container,
            source: Source::ChangeFeed(start),
            max_item_count,
            has_more_results: true,
        }
    }

    /// Whether another page may hold items.
    pub fn has_more_results(&self) -> bool {
        self.has_more_results
    }

    /// Token to resume from, if any.
    pub fn continuation_token(&self) -> Option<&str> {
        match &self.source {
            Source::Query { continuation, .. } => continuation.as_deref(),
            Source::ChangeFeed(ChangeFeedStart::Continuation(token)) => Some(token),
            Source::ChangeFeed(ChangeFeedStart::Beginning) => None,
        }
    }

    async fn read_page(&mut self) -> Result<FeedResponse, ContainerError> {
        let store = self.container.store();
        match &mut self.source {
            Source::Query {
                query,
                continuation,
            } => {
                if !self.has_more_results {
                    return Ok(FeedResponse {
                        status: StatusCode::Ok,
                        items: Vec::new(),
                        continuation_token: None,
                        request_charge: 0.0,
                    });
                }

                let page = store
                    .query_items(query, continuation.as_deref(), self.max_item_count)
                    .await?;
                continuation.clone_from(&page.continuation_token);
                self.has_more_results = page.continuation_token.is_some();
                Ok(page)
            }
            Source::ChangeFeed(start) => {
                let page = store
                    .read_change_feed(start, ChangeFeedMode::LatestVersion, self.max_item_count)
                    .await?;
                if let Some(token) = &page.continuation_token {
                    *start = ChangeFeedStart::Continuation(token.clone());
                }
                self.has_more_results = page.status != StatusCode::NotModified;
                Ok(page)
            }
        }
    }

    /// Reads and decrypts the next page.
    ///
    /// Items are decrypted concurrently. A failing item goes to the
    /// container's decryption result handler if one is set, otherwise the
    /// page fails.
    pub async fn read_next(&mut self) -> Result<FeedResponse, ContainerError> {
        let page = self.read_page().await?;
        debug!(container = %self.container.id(), count = page.items.len(), "Decrypting feed page");

        let items = self.container.decrypt_items(page.items).await?;
        Ok(FeedResponse { items, ..page })
    }

    /// Reads the next page without decrypting it.
    pub async fn read_next_decryptable(&mut self) -> Result<DecryptableFeedResponse, ContainerError> {
        let page = self.read_page().await?;
        let encryptor = self.container.encryptor();

        Ok(DecryptableFeedResponse {
            status: page.status,
            items: page
                .items
                .into_iter()
                .map(|item| DecryptableItem::new(item, encryptor.clone()))
                .collect(),
            continuation_token: page.continuation_token,
            request_charge: page.request_charge,
        })
    }
}
