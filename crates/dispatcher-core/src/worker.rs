//! Job worker (C4): one ephemeral task per dispatched `(job, backend)` pair.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::job::JobStore;

/// Outcome of calling the backend's verify endpoint, already mapped onto
/// the terminal transition it implies. See spec §4.4 / §6.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Success,
    Failure(String),
}

/// Map a backend HTTP response (status code + parsed JSON body, or a
/// transport-level failure) onto a [`VerifyOutcome`].
///
/// `status ∈ {"success", "sucesso"}` (case-insensitive) is success;
/// anything else 2xx is a backend-reported failure whose message is
/// extracted from `resultado.message`, `resultado.erro`, or `detail`, in
/// that order, falling back to a generic message that names the raw
/// status value.
pub fn map_verify_response(http_status: reqwest::StatusCode, body: &Value) -> VerifyOutcome {
    if !http_status.is_success() {
        return VerifyOutcome::Failure(format!("API call failed: HTTP {http_status}"));
    }

    let status = body
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();

    if status == "success" || status == "sucesso" {
        return VerifyOutcome::Success;
    }

    let resultado = body.get("resultado");
    let msg = resultado
        .and_then(|r| r.get("message"))
        .and_then(Value::as_str)
        .or_else(|| resultado.and_then(|r| r.get("erro")).and_then(Value::as_str))
        .or_else(|| body.get("detail").and_then(Value::as_str));

    match msg {
        Some(msg) => VerifyOutcome::Failure(msg.to_string()),
        None => VerifyOutcome::Failure(format!("API status: {status}")),
    }
}

/// A dispatched unit of work: one job, one backend.
///
/// `worker_id` is the lock identity the job was claimed/started under — it
/// must be passed back to `complete`/`fail` unchanged, or the guarded
/// `UPDATE` matches zero rows. `slot_id` (`worker_id:backend_index+1`) is a
/// display label only, for telling concurrently-dispatched jobs apart in
/// logs; it is never sent to the store.
pub struct Dispatch {
    pub job_id: Uuid,
    pub card_number: String,
    pub backend_index: usize,
    pub backend_url: String,
    pub worker_id: String,
    pub slot_id: String,
}

/// Run one worker to completion: call the backend and apply the terminal
/// transition. Freeing the backend slot (after any post-job cooldown) is
/// the caller's responsibility — see `Dispatcher::dispatch_one`.
pub async fn run_worker(
    dispatch: Dispatch,
    http: reqwest::Client,
    store: Arc<dyn JobStore>,
    verify_path: &str,
    api_token: &str,
    api_timeout: Duration,
) {
    let outcome = call_backend(
        &http,
        &dispatch.backend_url,
        verify_path,
        api_token,
        api_timeout,
        &dispatch.card_number,
    )
    .await;

    let applied = match &outcome {
        VerifyOutcome::Success => store.complete(dispatch.job_id, &dispatch.worker_id).await,
        VerifyOutcome::Failure(msg) => {
            store.fail(dispatch.job_id, &dispatch.worker_id, msg).await
        }
    };

    match applied {
        Ok(true) => info!(
            job_id = %dispatch.job_id,
            slot_id = %dispatch.slot_id,
            backend = %dispatch.backend_url,
            outcome = ?outcome,
            "job transition applied"
        ),
        Ok(false) => warn!(
            job_id = %dispatch.job_id,
            slot_id = %dispatch.slot_id,
            "terminal transition rejected: lease was stolen or already terminal"
        ),
        Err(err) => warn!(
            job_id = %dispatch.job_id,
            slot_id = %dispatch.slot_id,
            error = %err,
            "database error applying terminal transition; lease will expire and retry"
        ),
    }
}

async fn call_backend(
    http: &reqwest::Client,
    backend_url: &str,
    verify_path: &str,
    api_token: &str,
    timeout: Duration,
    card: &str,
) -> VerifyOutcome {
    let url = format!(
        "{}/{}",
        backend_url.trim_end_matches('/'),
        verify_path.trim_start_matches('/')
    );

    let response = http
        .post(&url)
        .bearer_auth(api_token)
        .timeout(timeout)
        .json(&serde_json::json!({ "card": card }))
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => return VerifyOutcome::Failure(format!("API call failed: {e}")),
    };

    let status = response.status();
    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            return VerifyOutcome::Failure(format!("API call failed: invalid response body: {e}"))
        }
    };

    map_verify_response(status, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use serde_json::json;

    #[test]
    fn maps_success_variants() {
        assert_eq!(
            map_verify_response(StatusCode::OK, &json!({"status": "success"})),
            VerifyOutcome::Success
        );
        assert_eq!(
            map_verify_response(StatusCode::OK, &json!({"status": "sucesso"})),
            VerifyOutcome::Success
        );
    }

    #[test]
    fn extracts_nested_resultado_message() {
        let outcome = map_verify_response(
            StatusCode::OK,
            &json!({"status": "erro", "resultado": {"message": "carteira invalida"}}),
        );
        assert_eq!(outcome, VerifyOutcome::Failure("carteira invalida".into()));
    }

    #[test]
    fn extracts_nested_resultado_erro_when_message_absent() {
        let outcome = map_verify_response(
            StatusCode::OK,
            &json!({"status": "erro", "resultado": {"erro": "sessao expirada"}}),
        );
        assert_eq!(outcome, VerifyOutcome::Failure("sessao expirada".into()));
    }

    #[test]
    fn falls_back_to_top_level_detail() {
        let outcome = map_verify_response(
            StatusCode::OK,
            &json!({"status": "error", "detail": "not found"}),
        );
        assert_eq!(outcome, VerifyOutcome::Failure("not found".into()));
    }

    #[test]
    fn falls_back_to_generic_message_when_nothing_present() {
        let outcome = map_verify_response(StatusCode::OK, &json!({"status": "error"}));
        assert_eq!(outcome, VerifyOutcome::Failure("API status: error".into()));
    }

    #[test]
    fn non_2xx_is_transport_style_failure() {
        let outcome = map_verify_response(StatusCode::INTERNAL_SERVER_ERROR, &json!({}));
        assert!(matches!(outcome, VerifyOutcome::Failure(msg) if msg.contains("500")));
    }
}
