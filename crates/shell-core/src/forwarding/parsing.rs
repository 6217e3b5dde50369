use rs_types::{ForwardKind, LocalForwardSpec, RemoteForwardSpec};

use crate::{SessionError, SessionResult};

/// Fields shared by `-L` and `-R` style specs.
struct ForwardFields {
    bind_address: Option<String>,
    bind_port: u16,
    target_host: String,
    target_port: u16,
}

/// Parse a local forward specification.
///
/// Format: `[bind_address:]port:host:hostport`. IPv6 addresses go in brackets.
pub fn parse_local_forward(spec: &str) -> SessionResult<LocalForwardSpec> {
    let fields = parse_fields(ForwardKind::Local, spec)?;
    Ok(LocalForwardSpec {
        bind_address: fields.bind_address,
        bind_port: fields.bind_port,
        target_host: fields.target_host,
        target_port: fields.target_port,
    })
}

/// Parse a remote forward specification.
///
/// Format: `[bind_address:]port:host:hostport`
pub fn parse_remote_forward(spec: &str) -> SessionResult<RemoteForwardSpec> {
    let fields = parse_fields(ForwardKind::Remote, spec)?;
    Ok(RemoteForwardSpec {
        bind_address: fields.bind_address,
        bind_port: fields.bind_port,
        target_host: fields.target_host,
        target_port: fields.target_port,
    })
}

fn parse_fields(kind: ForwardKind, spec: &str) -> SessionResult<ForwardFields> {
    let parts = split_colon_parts(spec);
    let (bind_address, rest) = match parts.as_slice() {
        [bind, rest @ ..] if rest.len() == 3 => (normalize_host(bind), rest),
        rest if rest.len() == 3 => (None, rest),
        _ => {
            return Err(SessionError::invalid_forward(
                kind.to_string(),
                "spec must be [bind_address:]port:host:hostport",
            ));
        }
    };
    Ok(ForwardFields {
        bind_address,
        bind_port: parse_port(&rest[0])?,
        target_host: normalize_host(&rest[1]).unwrap_or_else(|| "127.0.0.1".to_string()),
        target_port: parse_port(&rest[2])?,
    })
}

fn parse_port(value: &str) -> SessionResult<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| SessionError::InvalidPort(value.to_string()))
}

fn normalize_host(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    Some(inner.to_string())
}

/// Split on colons that are not inside `[...]`.
fn split_colon_parts(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in input.chars() {
        match ch {
            ':' if depth == 0 => parts.push(std::mem::take(&mut current)),
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts.into_iter().map(|part| part.trim().to_string()).collect()
}

#[cfg(test)]
#[path = "parsing_tests.rs"]
mod tests;
