//! Flattens a paginated remote collection into one lazy, ordered stream.
//!
//! Page 1 is always fetched first because only it is trusted for
//! `page_count`. Pages `2..=page_count` follow in order. The first failing
//! fetch ends the stream with that error; nothing after it is fetched.

use std::future::Future;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::contract::{FileEntry, Page, RemoteService, Session, User};
use crate::error::{Error, Result};
use crate::identity::ObjectKey;

struct Cursor<F> {
    fetch: F,
    next: u32,
    page_count: Option<u32>,
}

/// Enumerate every item reachable through `fetch(page)`.
///
/// The stream is not restartable; call `enumerate` again to re-fetch from
/// page 1.
pub fn enumerate<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T>>
where
    T: Send + 'a,
    F: FnMut(u32) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>>> + Send + 'a,
{
    let cursor = Cursor {
        fetch,
        next: 1,
        page_count: None,
    };

    stream::try_unfold(cursor, |mut cursor| async move {
        if let Some(count) = cursor.page_count {
            if cursor.next > count {
                return Ok(None);
            }
        }

        let page = (cursor.fetch)(cursor.next).await?;
        if cursor.page_count.is_none() {
            info!(
                total_count = page.total_count,
                page_count = page.page_count,
                per_page = page.per_page,
                "Remote collection size"
            );
            cursor.page_count = Some(page.page_count.max(1));
        }
        debug!(page = cursor.next, items = page.items.len(), "Fetched page");
        cursor.next += 1;

        let items = stream::iter(page.items.into_iter().map(Ok::<T, Error>));
        Ok::<_, Error>(Some((items, cursor)))
    })
    .try_flatten()
    .boxed()
}

/// Every file entry known to the remote service.
pub fn files<'a, R>(remote: &'a R, session: &'a Session) -> BoxStream<'a, Result<FileEntry>>
where
    R: RemoteService + ?Sized,
{
    enumerate(move |page| remote.list_files(session, page))
}

/// Every registered user.
pub fn users<'a, R>(remote: &'a R, session: &'a Session) -> BoxStream<'a, Result<User>>
where
    R: RemoteService + ?Sized,
{
    enumerate(move |page| remote.list_users(session, page))
}

/// Drain the file listing into keys. Stops at the first failed page or the
/// first malformed hash.
pub async fn collect_keys<R>(remote: &R, session: &Session) -> Result<Vec<ObjectKey>>
where
    R: RemoteService + ?Sized,
{
    files(remote, session)
        .and_then(|entry| async move { entry.sha256.parse::<ObjectKey>() })
        .try_collect()
        .await
}
