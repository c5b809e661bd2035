use std::collections::HashMap;
use std::time::Duration;

use crate::error::{AppError, Result};

/// ERC-165 `supportsInterface(bytes4)`.
pub const SUPPORTS_INTERFACE_SELECTOR: &str = "01ffc9a7";
/// ERC-721 `tokenURI(uint256)`.
pub const TOKEN_URI_SELECTOR: &str = "c87b56dd";

pub const ERC721_INTERFACE_ID: [u8; 4] = [0x80, 0xac, 0x58, 0xcd];
pub const ERC721_METADATA_INTERFACE_ID: [u8; 4] = [0x5b, 0x5e, 0x13, 0x9f];
pub const ERC2981_INTERFACE_ID: [u8; 4] = [0x2a, 0x55, 0x20, 0x5a];
pub const ROYALTIES_V2_INTERFACE_ID: [u8; 4] = [0xca, 0xd9, 0x6c, 0xca];
pub const DROP_V1_INTERFACE_ID: [u8; 4] = [0x0f, 0x5f, 0x7d, 0x1b];

/// Result of one `eth_call`: the node answered with return data, or the
/// call reverted on-chain. Transport failures surface as `Err` instead —
/// they say nothing about the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Returned(String),
    Reverted,
}

#[derive(serde::Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

/// Minimal JSON-RPC client, one endpoint per network.
pub struct RpcClient {
    http: reqwest::Client,
    urls: HashMap<String, String>,
}

impl RpcClient {
    pub fn new(urls: HashMap<String, String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, urls })
    }

    pub async fn eth_call(&self, network: &str, to: &str, data: &str) -> Result<CallOutcome> {
        let url = self
            .urls
            .get(network)
            .ok_or_else(|| AppError::Config(format!("no RPC endpoint for network {network}")))?;

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [{ "to": to, "data": data }, "latest"],
        });

        let resp: RpcResponse = self.http.post(url).json(&body).send().await?.json().await?;

        match (resp.result, resp.error) {
            (Some(result), _) => Ok(CallOutcome::Returned(result)),
            (None, Some(_)) => Ok(CallOutcome::Reverted),
            (None, None) => Err(AppError::Feed("empty JSON-RPC response".to_string())),
        }
    }
}

/// Calldata for `supportsInterface(interface_id)`.
pub fn encode_supports_interface(interface_id: [u8; 4]) -> String {
    let id_hex: String = interface_id.iter().map(|b| format!("{b:02x}")).collect();
    format!("0x{SUPPORTS_INTERFACE_SELECTOR}{id_hex}{}", "0".repeat(56))
}

/// Calldata for `tokenURI(token_id)`. `token_id` is the feed's decimal
/// string; it may exceed u128, so conversion works digit by digit.
pub fn encode_token_uri(token_id: &str) -> Result<String> {
    let hex = decimal_to_hex(token_id)
        .ok_or_else(|| AppError::Feed(format!("invalid token id: {token_id}")))?;
    Ok(format!("0x{TOKEN_URI_SELECTOR}{hex:0>64}"))
}

/// Decode the 32-byte boolean returned by `supportsInterface`.
pub fn decode_bool_result(result: &str) -> Option<bool> {
    let hex = result.strip_prefix("0x")?;
    if hex.is_empty() {
        return None;
    }
    Some(hex.chars().last() == Some('1'))
}

/// ABI-decode a dynamically-sized string return value (offset, length,
/// bytes). Returns `None` when the payload is malformed.
pub fn decode_string_result(result: &str) -> Option<String> {
    let hex = result.strip_prefix("0x")?;
    if hex.len() < 128 {
        return None;
    }
    let length = usize::from_str_radix(&hex[64..128], 16).ok()?;
    let data = hex.get(128..128 + length * 2)?;

    let bytes: Vec<u8> = (0..data.len())
        .step_by(2)
        .filter_map(|i| u8::from_str_radix(&data[i..i + 2], 16).ok())
        .collect();
    String::from_utf8(bytes).ok()
}

fn decimal_to_hex(decimal: &str) -> Option<String> {
    if decimal.is_empty() || !decimal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut digits: Vec<u8> = decimal.bytes().map(|b| b - b'0').collect();
    let mut hex = Vec::new();

    while digits.iter().any(|&d| d != 0) {
        let mut remainder = 0u32;
        for d in digits.iter_mut() {
            let value = remainder * 10 + u32::from(*d);
            *d = (value / 16) as u8;
            remainder = value % 16;
        }
        hex.push(char::from_digit(remainder, 16)?);
    }

    if hex.is_empty() {
        hex.push('0');
    }
    Some(hex.into_iter().rev().collect())
}
