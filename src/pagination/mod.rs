//! Pagination: a cursor-returning fetch as a lazy sequence of pages
//!
//! The fetch receives the previous page's next-cursor (None on the first
//! call) and returns a page plus an optional next cursor. Iteration ends
//! when the cursor is absent; empty page arrays are legal and do not
//! terminate it. A permanent fetch failure ends the sequence with the error.

use crate::error::Result;
use async_stream::try_stream;
use futures::Stream;
use serde_json::Value;
use std::future::Future;

/// One fetched page with its continuation cursor
#[derive(Debug, Clone)]
pub struct PageChunk<C> {
    pub data: Vec<Value>,
    pub next: Option<C>,
}

/// Turn a cursor-returning fetch into a stream of page arrays
pub fn pages<C, F, Fut>(mut fetch: F) -> impl Stream<Item = Result<Vec<Value>>>
where
    C: Send,
    F: FnMut(Option<C>) -> Fut + Send,
    Fut: Future<Output = Result<PageChunk<C>>> + Send,
{
    try_stream! {
        let mut cursor = None;
        loop {
            let page = fetch(cursor.take()).await?;
            let next = page.next;
            yield page.data;
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
    }
}

/// Flatten a page stream into a record stream
pub fn records<C, F, Fut>(fetch: F) -> impl Stream<Item = Result<Value>>
where
    C: Send,
    F: FnMut(Option<C>) -> Fut + Send,
    Fut: Future<Output = Result<PageChunk<C>>> + Send,
{
    try_stream! {
        for await page in pages(fetch) {
            for record in page? {
                yield record;
            }
        }
    }
}
