use crate::types::{Language, Submission, SubmissionRecord, SubmissionStatus};
use redis::{AsyncCommands, RedisResult};

/// Redis key layout shared by the API and the workers.
///
/// Keeping the names here means API and worker never drift and queue keys
/// stay deterministic per language.

pub const QUEUE_PREFIX: &str = "sentinel:queue";
pub const RESULT_PREFIX: &str = "sentinel:result";
pub const STATUS_PREFIX: &str = "sentinel:status";
pub const CANCEL_PREFIX: &str = "sentinel:cancel";

/// Deterministic queue name for a language
pub fn queue_name(language: &Language) -> String {
    format!("{}:{}", QUEUE_PREFIX, language)
}

pub fn result_key(id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, id)
}

pub fn status_key(id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, id)
}

pub fn cancel_key(id: &uuid::Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, id)
}

fn encode<T: serde::Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}

fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
    })
}

/// Push a submission onto its language queue (RPUSH, FIFO with BLPOP)
pub async fn push_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission: &Submission,
    ttl_secs: u64,
) -> RedisResult<()> {
    let payload = encode(submission)?;
    let _: () = conn
        .set_ex(status_key(&submission.id), encode(&SubmissionStatus::Queued)?, ttl_secs)
        .await?;
    conn.rpush(queue_name(&submission.language), payload).await
}

/// Put a submission back at the head of its queue
pub async fn requeue_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission: &Submission,
) -> RedisResult<()> {
    let payload = encode(submission)?;
    conn.lpush(queue_name(&submission.language), payload).await
}

/// Pop the next submission from any of the given language queues.
/// BLPOP with a timeout so the caller can observe shutdown.
pub async fn pop_submission(
    conn: &mut redis::aio::ConnectionManager,
    languages: &[Language],
    timeout_seconds: f64,
) -> RedisResult<Option<Submission>> {
    let queues: Vec<String> = languages.iter().map(queue_name).collect();
    let result: Option<(String, String)> = conn.blpop(&queues, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => Ok(Some(decode(&payload)?)),
        None => Ok(None),
    }
}

pub async fn set_status(
    conn: &mut redis::aio::ConnectionManager,
    id: &uuid::Uuid,
    status: SubmissionStatus,
    ttl_secs: u64,
) -> RedisResult<()> {
    conn.set_ex(status_key(id), encode(&status)?, ttl_secs).await
}

pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    id: &uuid::Uuid,
) -> RedisResult<Option<SubmissionStatus>> {
    let payload: Option<String> = conn.get(status_key(id)).await?;
    payload.map(|p| decode(&p)).transpose()
}

/// Persist a finished submission and flip its status to Finished
pub async fn store_record(
    conn: &mut redis::aio::ConnectionManager,
    record: &SubmissionRecord,
    ttl_secs: u64,
) -> RedisResult<()> {
    let _: () = conn
        .set_ex(result_key(&record.submission_id), encode(record)?, ttl_secs)
        .await?;
    set_status(conn, &record.submission_id, SubmissionStatus::Finished, ttl_secs).await
}

pub async fn get_record(
    conn: &mut redis::aio::ConnectionManager,
    id: &uuid::Uuid,
) -> RedisResult<Option<SubmissionRecord>> {
    let payload: Option<String> = conn.get(result_key(id)).await?;
    payload.map(|p| decode(&p)).transpose()
}

pub async fn request_cancel(
    conn: &mut redis::aio::ConnectionManager,
    id: &uuid::Uuid,
    ttl_secs: u64,
) -> RedisResult<()> {
    conn.set_ex(cancel_key(id), "1", ttl_secs).await
}

pub async fn is_cancelled(
    conn: &mut redis::aio::ConnectionManager,
    id: &uuid::Uuid,
) -> RedisResult<bool> {
    conn.exists(cancel_key(id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_queue_naming() {
        assert_eq!(queue_name(&Language::Cpp), "sentinel:queue:cpp");
        assert_eq!(queue_name(&Language::Java), "sentinel:queue:java");
        assert_eq!(queue_name(&Language::Python), "sentinel:queue:python");
    }

    #[test]
    fn test_keys_are_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("sentinel:result:"));
        assert!(status_key(&id).ends_with(&id.to_string()));
        assert!(cancel_key(&id).starts_with("sentinel:cancel:"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode::<Submission>("not json").unwrap_err();
        assert_eq!(err.kind(), redis::ErrorKind::TypeError);
    }
}
