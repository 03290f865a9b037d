//! The miner-facing endpoint.
//!
//! A single handler serves every path and dispatches on the `requestType`
//! form field, accepting parameters from the URL query and the form body
//! alike (body wins on conflicts, matching what miners send).

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::admission::{success_body, Admission};
use crate::chain::Chain;
use crate::types::MinerRound;

use super::AppState;

pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let params = collect_params(query.as_deref(), &body);
    match params.get("requestType").map(String::as_str) {
        Some("getMiningInfo") => mining_info(&state, peer, &headers),
        Some("submitNonce") => submit_nonce(&state, peer, &headers, &params).await,
        _ => error_response(StatusCode::BAD_REQUEST, "4", "unknown request type"),
    }
}

fn mining_info(state: &AppState, peer: SocketAddr, headers: &HeaderMap) -> Response {
    let chain = Chain::from_primary_flag(state.chains.current_block().primary);
    let Some(info) = state.chains.current_info(chain) else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "3",
            "mining info unavailable",
        );
    };

    // Refresh the caller's inventory entry from its headers.
    let miner = miner_name(headers);
    let alias = header_value(headers, "X-MinerAlias");
    let xpu = header_value(headers, "X-Xpu");
    let capacity = header_value(headers, "X-Capacity").parse().unwrap_or(0);
    state.clients.update(
        &peer.ip().to_string(),
        &peer.port().to_string(),
        &miner,
        &alias,
        &xpu,
        capacity,
    );
    if let Some(push) = &state.push {
        push.set_capacity(state.clients.total_capacity());
    }

    json_response(StatusCode::OK, info.payload.clone())
}

async fn submit_nonce(
    state: &AppState,
    peer: SocketAddr,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Response {
    let round = match parse_round(params, headers) {
        Ok(round) => round,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "1", message),
    };
    let miner = miner_name(headers);

    match state.engine.try_update(peer, &miner, &round).await {
        Admission::Updated(body) => json_response(StatusCode::OK, body),
        Admission::NotUpdated => json_response(
            StatusCode::OK,
            success_body(state.chains.response_deadline(&round)),
        ),
        Admission::WrongHeight => {
            error_response(StatusCode::BAD_REQUEST, "1005", "Submitted on wrong height")
        }
        Admission::ExceededMinersPerIp => error_response(
            StatusCode::BAD_REQUEST,
            "2",
            "too many submissions from different account ids by same ip",
        ),
        Admission::RemoteError => json_response(
            StatusCode::OK,
            br#"{"error":{"code":3,"message":"error reaching pool or wallet"}}"#.to_vec(),
        ),
    }
}

/// Merge URL query and form-body parameters; body entries win.
fn collect_params(query: Option<&str>, body: &[u8]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }
    params
}

fn parse_round(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<MinerRound, &'static str> {
    let (deadline, adjusted) = match params.get("deadline").and_then(|value| value.parse().ok()) {
        Some(deadline) => (deadline, false),
        // Some mining software pre-divides the deadline and ships it in a
        // header instead of the form body.
        None => match header_value(headers, "X-Deadline").parse().ok() {
            Some(deadline) => (deadline, true),
            None => return Err("deadline submission has wrong format"),
        },
    };
    let nonce = params
        .get("nonce")
        .and_then(|value| value.parse().ok())
        .ok_or("nonce submission has wrong format")?;
    let height = params
        .get("blockheight")
        .and_then(|value| value.parse().ok())
        .ok_or("blockheight submission has wrong format")?;
    let account_id = params
        .get("accountId")
        .and_then(|value| value.parse().ok())
        .ok_or("account id submission has wrong format")?;
    let passphrase = params.get("secretPhrase").cloned();

    Ok(MinerRound {
        account_id,
        height,
        nonce,
        deadline,
        passphrase,
        adjusted,
    })
}

/// The miner's software name: User-Agent, falling back to X-Miner.
fn miner_name(headers: &HeaderMap) -> String {
    let user_agent = header_value(headers, header::USER_AGENT.as_str());
    if user_agent.is_empty() {
        header_value(headers, "X-Miner")
    } else {
        user_agent
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn error_response(status: StatusCode, code: &str, description: &str) -> Response {
    let body = serde_json::json!({
        "errorCode": code,
        "errorDescription": description,
    })
    .to_string()
    .into_bytes();
    json_response(status, body)
}
