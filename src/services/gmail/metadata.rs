//! Stage 1 (§4.9): paginated inbox sweep, headers fetched concurrently under
//! a shared limiter, streamed to the caller in batches of 100.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use super::client::GmailApiClient;
use crate::models::GmailMessageHeader;
use crate::utils::ApiResult;

const BATCH_SIZE: usize = 100;
const LIST_PAGE_SIZE: u32 = 500;

pub async fn sweep_inbox<F>(
    gmail: &Arc<dyn GmailApiClient>,
    access_token: &str,
    max_emails: u32,
    concurrency_limit: usize,
    mut on_batch_ready: F,
) -> ApiResult<Vec<GmailMessageHeader>>
where
    F: FnMut(&[GmailMessageHeader]),
{
    let limiter = Arc::new(Semaphore::new(concurrency_limit.max(1)));
    let mut all_ids = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let (ids, next) =
            gmail.list_message_ids(access_token, LIST_PAGE_SIZE, page_token.as_deref()).await?;
        all_ids.extend(ids);
        if all_ids.len() as u32 >= max_emails || next.is_none() {
            break;
        }
        page_token = next;
    }
    all_ids.truncate(max_emails as usize);

    let mut headers = Vec::with_capacity(all_ids.len());
    for chunk in all_ids.chunks(BATCH_SIZE) {
        let tasks = chunk.iter().map(|id| {
            let gmail = Arc::clone(gmail);
            let limiter = Arc::clone(&limiter);
            let id = id.clone();
            let access_token = access_token.to_string();
            async move {
                let _permit = limiter.acquire().await.ok()?;
                gmail.get_message_header(&access_token, &id).await.ok()
            }
        });
        let batch: Vec<GmailMessageHeader> = join_all(tasks).await.into_iter().flatten().collect();
        on_batch_ready(&batch);
        headers.extend(batch);
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeGmail {
        total_ids: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GmailApiClient for FakeGmail {
        async fn list_message_ids(
            &self,
            _access_token: &str,
            _page_size: u32,
            _page_token: Option<&str>,
        ) -> ApiResult<(Vec<String>, Option<String>)> {
            let ids = (0..self.total_ids).map(|i| format!("msg-{i}")).collect();
            Ok((ids, None))
        }

        async fn get_message_header(
            &self,
            _access_token: &str,
            message_id: &str,
        ) -> ApiResult<GmailMessageHeader> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(GmailMessageHeader {
                message_id: message_id.to_string(),
                subject: "Lab Results".to_string(),
                from_email: "lab@example.test".to_string(),
                from_name: None,
                date: None,
            })
        }

        async fn get_message_body(
            &self,
            _access_token: &str,
            _message_id: &str,
        ) -> ApiResult<super::super::client::RawMessage> {
            unimplemented!()
        }

        async fn get_attachment_bytes(
            &self,
            _access_token: &str,
            _message_id: &str,
            _attachment_id: &str,
        ) -> ApiResult<Vec<u8>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn sweeps_all_messages_in_batches() {
        let gmail: Arc<dyn GmailApiClient> =
            Arc::new(FakeGmail { total_ids: 5, calls: AtomicUsize::new(0) });
        let mut batch_count = 0;
        let headers = sweep_inbox(&gmail, "token", 10, 2, |_batch| batch_count += 1).await.unwrap();
        assert_eq!(headers.len(), 5);
        assert_eq!(batch_count, 1);
    }

    #[tokio::test]
    async fn caps_at_max_emails() {
        let gmail: Arc<dyn GmailApiClient> =
            Arc::new(FakeGmail { total_ids: 20, calls: AtomicUsize::new(0) });
        let headers = sweep_inbox(&gmail, "token", 3, 2, |_| {}).await.unwrap();
        assert_eq!(headers.len(), 3);
    }
}
