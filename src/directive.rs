//! Block-style configuration, as written in a server config file:
//!
//! ```text
//! loki {
//!     url http://localhost:3100/loki/api/v1/push
//!     tenant_id team-a
//!     batchwait 2s
//!     labels {
//!         app  svc
//!         host "edge 01"
//!     }
//!     backoff_config {
//!         min_period 1s
//!         max_retries 5
//!     }
//!     drop_rate_limited_batches
//! }
//! ```
//!
//! A directive is a name followed by the arguments on the same line and an
//! optional `{ ... }` block. `#` starts a comment, double quotes group words.

use std::collections::BTreeMap;

use crate::config::{BasicAuth, OAuth2, RawConfig};
use crate::error::ConfigError;
use crate::secret::Secret;

/// Name the block must start with
pub const MODULE_NAME: &str = "loki";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
    quoted: bool,
}

impl Token {
    fn is_open(&self) -> bool {
        !self.quoted && self.text == "{"
    }

    fn is_close(&self) -> bool {
        !self.quoted && self.text == "}"
    }
}

/// One parsed directive: `name args... { block }`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    name: String,
    line: usize,
    args: Vec<String>,
    block: Vec<Directive>,
}

impl Directive {
    fn arg(&self) -> Result<&str, ConfigError> {
        self.args
            .first()
            .map(String::as_str)
            .ok_or_else(|| ConfigError::missing_argument(&self.name, self.line))
    }

    fn duration_arg(&self) -> Result<crate::duration::StrTimeDuration, ConfigError> {
        self.arg()?
            .parse()
            .map_err(|e| ConfigError::invalid_duration(&self.name, e))
    }

    fn int_arg<T: std::str::FromStr>(&self) -> Result<T, ConfigError> {
        let value = self.arg()?;
        value.parse().map_err(|_| ConfigError::invalid_int(&self.name, value))
    }

    /// A nested block of `key value` pairs.
    fn map_block(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        self.block
            .iter()
            .map(|pair| Ok((pair.name.clone(), pair.arg()?.to_string())))
            .collect()
    }

    fn unrecognized(&self) -> ConfigError {
        ConfigError::new(
            &self.name,
            format!("is not a recognized subdirective (line {})", self.line),
        )
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();

    for (idx, raw_line) in input.lines().enumerate() {
        let line = idx + 1;
        let mut chars = raw_line.chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else if c == '#' {
                break;
            } else if c == '"' {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => text.push(escaped),
                            Some(other) => {
                                text.push('\\');
                                text.push(other);
                            }
                            None => text.push('\\'),
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        _ => text.push(c),
                    }
                }
                if !closed {
                    return Err(ConfigError::new(
                        "config",
                        format!("has an unterminated quoted string (line {line})"),
                    ));
                }
                tokens.push(Token { text, line, quoted: true });
            } else {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '"' {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                tokens.push(Token { text, line, quoted: false });
            }
        }
    }

    Ok(tokens)
}

fn parse_directives(tokens: &[Token], pos: &mut usize, nested: bool) -> Result<Vec<Directive>, ConfigError> {
    let mut directives = Vec::new();

    loop {
        let Some(tok) = tokens.get(*pos) else {
            if nested {
                return Err(ConfigError::new("config", "has an unclosed block"));
            }
            return Ok(directives);
        };

        if tok.is_close() {
            if nested {
                *pos += 1;
                return Ok(directives);
            }
            return Err(ConfigError::new(
                "config",
                format!("has an unexpected '}}' (line {})", tok.line),
            ));
        }
        if tok.is_open() {
            return Err(ConfigError::new(
                "config",
                format!("has a block without a directive (line {})", tok.line),
            ));
        }

        let mut directive = Directive {
            name: tok.text.clone(),
            line: tok.line,
            args: Vec::new(),
            block: Vec::new(),
        };
        *pos += 1;

        while let Some(arg) = tokens.get(*pos) {
            if arg.line != directive.line || arg.is_open() || arg.is_close() {
                break;
            }
            directive.args.push(arg.text.clone());
            *pos += 1;
        }

        if let Some(open) = tokens.get(*pos) {
            if open.is_open() && open.line == directive.line {
                *pos += 1;
                directive.block = parse_directives(tokens, pos, true)?;
            }
        }

        directives.push(directive);
    }
}

/// Parse a `loki { ... }` block into a [`RawConfig`].
///
/// The block may also give the URL inline: `loki http://host/loki/api/v1/push`.
///
/// # Errors
///
/// Returns `ConfigError` when the block is malformed, a key is unknown, an
/// argument is missing, or a duration or integer does not parse.
pub fn parse_block(input: &str) -> Result<RawConfig, ConfigError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let directives = parse_directives(&tokens, &mut pos, false)?;

    let module = match directives.as_slice() {
        [module] if module.name == MODULE_NAME => module,
        [] => return Err(ConfigError::missing_argument(MODULE_NAME, 1)),
        [other, ..] => {
            return Err(ConfigError::new(
                "config",
                format!("must start with {MODULE_NAME:?}, found {:?} (line {})", other.name, other.line),
            ))
        }
    };

    let mut raw = RawConfig::default();
    if let Some(url) = module.args.first() {
        raw.url = url.clone();
    }

    for d in &module.block {
        apply(&mut raw, d)?;
    }

    Ok(raw)
}

fn apply(raw: &mut RawConfig, d: &Directive) -> Result<(), ConfigError> {
    match d.name.as_str() {
        "url" => raw.url = d.arg()?.to_string(),
        "headers" => raw.headers = d.map_block()?,
        "tenant_id" => raw.tenant_id = d.arg()?.to_string(),
        "batchwait" => raw.batchwait = d.duration_arg()?,
        "batchsize" => raw.batchsize = d.int_arg()?,
        "basic_auth" => raw.basic_auth = Some(basic_auth(d)?),
        "oauth2" => raw.oauth2 = Some(oauth2(d)?),
        "bearer_token" => raw.bearer_token = Secret::new(d.arg()?),
        "bearer_token_file" => raw.bearer_token_file = d.arg()?.to_string(),
        "proxy_url" => raw.proxy_url = d.arg()?.to_string(),
        "tls_config" => {
            for sub in &d.block {
                let tls = &mut raw.tls_config;
                match sub.name.as_str() {
                    "ca_file" => tls.ca_file = sub.arg()?.to_string(),
                    "cert_file" => tls.cert_file = sub.arg()?.to_string(),
                    "key_file" => tls.key_file = sub.arg()?.to_string(),
                    "key" => tls.key = Secret::new(sub.arg()?),
                    "server_name" => tls.server_name = sub.arg()?.to_string(),
                    "insecure_skip_verify" => tls.insecure_skip_verify = true,
                    _ => return Err(sub.unrecognized()),
                }
            }
        }
        "backoff_config" => {
            for sub in &d.block {
                let backoff = &mut raw.backoff_config;
                match sub.name.as_str() {
                    "min_period" => backoff.min_period = sub.duration_arg()?,
                    "max_period" => backoff.max_period = sub.duration_arg()?,
                    "max_retries" => backoff.max_retries = sub.int_arg()?,
                    _ => return Err(sub.unrecognized()),
                }
            }
        }
        "drop_rate_limited_batches" => raw.drop_rate_limited_batches = true,
        "labels" => raw.labels = d.map_block()?,
        "timeout" => raw.timeout = d.duration_arg()?,
        "max_streams" => raw.max_streams = d.int_arg()?,
        "max_line_size" => raw.max_line_size = d.int_arg()?,
        "max_line_size_truncate" => raw.max_line_size_truncate = true,
        _ => return Err(d.unrecognized()),
    }
    Ok(())
}

fn basic_auth(d: &Directive) -> Result<BasicAuth, ConfigError> {
    let mut auth = BasicAuth::default();
    for sub in &d.block {
        match sub.name.as_str() {
            "username" => auth.username = sub.arg()?.to_string(),
            "username_file" => auth.username_file = sub.arg()?.to_string(),
            "password" => auth.password = Secret::new(sub.arg()?),
            "password_file" => auth.password_file = sub.arg()?.to_string(),
            _ => return Err(sub.unrecognized()),
        }
    }
    Ok(auth)
}

fn oauth2(d: &Directive) -> Result<OAuth2, ConfigError> {
    let mut oauth = OAuth2::default();
    for sub in &d.block {
        match sub.name.as_str() {
            "client_id" => oauth.client_id = sub.arg()?.to_string(),
            "client_secret" => oauth.client_secret = Secret::new(sub.arg()?),
            "scopes" => {
                sub.arg()?;
                oauth.scopes = sub.args.clone();
            }
            "token_url" => oauth.token_url = sub.arg()?.to_string(),
            "endpoint_params" => oauth.endpoint_params = sub.map_block()?,
            _ => return Err(sub.unrecognized()),
        }
    }
    Ok(oauth)
}
