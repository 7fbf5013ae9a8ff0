use crate::types::RemoteCommand;

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const REPORT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Largest directive body read from the command endpoint.
pub const MAX_DIRECTIVE_BYTES: usize = 256;

/// Parses the directive carried by the first line of a response body.
///
/// Matching is exact and case-sensitive; anything else is a no-op.
pub fn parse_directive(body: &str) -> RemoteCommand {
    let line = body.split('\n').next().unwrap_or_default();
    let line = line.strip_suffix('\r').unwrap_or(line);

    match line {
        "lock" => RemoteCommand::Lock,
        "unlock" => RemoteCommand::Unlock,
        "status" => RemoteCommand::QueryStatus,
        _ => RemoteCommand::None,
    }
}

/// Same as [`parse_directive`] for a raw, possibly non-UTF-8 body.
pub fn parse_directive_bytes(body: &[u8]) -> RemoteCommand {
    let end = body
        .iter()
        .position(|byte| *byte == b'\n')
        .unwrap_or(body.len());
    match std::str::from_utf8(&body[..end]) {
        Ok(line) => parse_directive(line),
        Err(_) => RemoteCommand::None,
    }
}

/// Form body for the status report POST.
pub fn encode_report_body(status_line: &str) -> String {
    format!("status={}", urlencoding::encode(status_line))
}
