//! Lowering and resolution of declarative I/O nodes
//!
//! [`OperationSpec::from_node`] validates a Query, Data, Fetch, Invoke or
//! Llm node once. [`OperationSpec::resolve`] evaluates it against the
//! current context into an [`Operation`] the engine can execute, or rejects
//! it with the failure that becomes its Result Object.

use crate::ast::{Node, NodeKind, SourceSpan, Template};
use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::directives::{
    flag_attr, identifier_attr, required_attr, required_template, template_attr, uint_attr,
    ParamSpec,
};
use crate::error::{ParamError, ParseError, RenderError};
use crate::evaluator::Evaluator;
use crate::import::{DataFormat, FieldSpec, ImportOptions};
use crate::providers::{BoundParam, ChatMessage, GenerationParams, HttpRequest};
use crate::result::{ErrorKind, OperationError};
use crate::token_parser::parse_template;
use crate::transform::{steps_of, TransformStep};
use crate::types::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// CHILD SPECS
// =============================================================================

/// `<q:header name value>`
#[derive(Debug, Clone)]
pub struct HeaderSpec {
    pub name: String,
    pub value: Template,
}

impl HeaderSpec {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        Ok(Self {
            name: required_attr(node, "name")?.to_string(),
            value: required_template(node, "value")?,
        })
    }
}

/// `<q:message role content>` or `<q:message role>text</q:message>`
#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub role: String,
    pub content: Template,
}

impl MessageSpec {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let role = node.attr("role").unwrap_or("user").trim().to_ascii_lowercase();
        if !matches!(role.as_str(), "system" | "user" | "assistant") {
            return Err(ParseError::attribute(
                NodeKind::Message,
                "role",
                format!("Message role must be system, user or assistant, got '{}'", role),
                node.attr_span("role"),
            ));
        }
        let content = match template_attr(node, "content")? {
            Some(content) => content,
            None => {
                let text = node.text_content();
                if text.trim().is_empty() {
                    return Err(ParseError::missing_attribute(NodeKind::Message, "content", node.span));
                }
                parse_template(text.trim()).map_err(|e| {
                    ParseError::syntax(format!("invalid expression in Message: {}", e), node.span)
                        .on_node(NodeKind::Message)
                })?
            }
        };
        Ok(Self { role, content })
    }
}

// =============================================================================
// TARGETS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Json,
    Text,
    /// JSON when the body or content type says so, text otherwise
    Auto,
}

#[derive(Debug, Clone)]
pub enum HttpBase {
    Url(Template),
    /// Relative to `http.base_url`
    Endpoint(Template),
    /// Named in `[services]`
    Service(String),
}

#[derive(Debug, Clone)]
pub enum DataSourceSpec {
    /// URL or file path
    Location(Template),
    /// Rows held by an in-scope variable
    Variable(String),
    Inline(String),
}

#[derive(Debug, Clone)]
pub enum TargetSpec {
    Function(String),
    Component(String),
    Http {
        base: HttpBase,
        path: Option<Template>,
        method: Option<String>,
        body: Option<Template>,
        headers: Vec<HeaderSpec>,
        response_type: ResponseType,
    },
    Sql {
        datasource: Template,
        statement: String,
    },
    Import {
        source: DataSourceSpec,
        options: Option<ImportOptions>,
    },
    Model {
        model: Template,
        system: Option<Template>,
        prompt: Option<Template>,
        messages: Vec<MessageSpec>,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
    },
}

impl TargetSpec {
    fn is_local(&self) -> bool {
        matches!(self, TargetSpec::Function(_) | TargetSpec::Component(_))
    }
}

/// Pick the single target attribute present among `choices`
fn single_target<'a>(node: &Node, choices: &[&'a str]) -> Result<&'a str, ParseError> {
    let present: Vec<&str> = choices.iter().copied().filter(|c| node.has_attr(c)).collect();
    match present.as_slice() {
        [one] => Ok(*one),
        [] => {
            let list = match choices {
                [init @ .., last] => format!("{} or {}", init.join(", "), last),
                [] => String::new(),
            };
            Err(ParseError::attribute(
                node.kind,
                choices[0],
                format!("{} requires a target ({})", node.kind, list),
                node.span,
            ))
        }
        [_, second, ..] => Err(ParseError::attribute(
            node.kind,
            second,
            format!("{} can only specify one target", node.kind),
            node.attr_span(second),
        )),
    }
}

fn http_target(node: &Node, base_attr: &str) -> Result<TargetSpec, ParseError> {
    let base = match base_attr {
        "url" => HttpBase::Url(required_template(node, "url")?),
        "endpoint" => HttpBase::Endpoint(required_template(node, "endpoint")?),
        _ => HttpBase::Service(identifier_attr(node, "service")?),
    };
    let method = match node.attr("method") {
        Some(raw) => {
            let method = raw.trim().to_ascii_uppercase();
            if !matches!(
                method.as_str(),
                "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD"
            ) {
                return Err(ParseError::attribute(
                    node.kind,
                    "method",
                    format!("{} has unknown method '{}'", node.kind, raw.trim()),
                    node.attr_span("method"),
                ));
            }
            Some(method)
        }
        None => None,
    };
    let response_type = match node.attr("response_type").map(|r| r.trim().to_ascii_lowercase()) {
        None => ResponseType::Auto,
        Some(r) if r == "auto" => ResponseType::Auto,
        Some(r) if r == "json" => ResponseType::Json,
        Some(r) if r == "text" => ResponseType::Text,
        Some(r) => {
            return Err(ParseError::attribute(
                node.kind,
                "response_type",
                format!("{} has unknown response_type '{}'", node.kind, r),
                node.attr_span("response_type"),
            ))
        }
    };
    let headers = node
        .children_of(NodeKind::Header)
        .map(HeaderSpec::from_node)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TargetSpec::Http {
        base,
        path: template_attr(node, "path")?,
        method,
        body: template_attr(node, "body")?,
        headers,
        response_type,
    })
}

fn data_target(node: &Node) -> Result<TargetSpec, ParseError> {
    let inline: String = node
        .children_of(NodeKind::Text)
        .filter_map(|c| c.text.as_deref())
        .collect();
    let inline = inline.trim();

    let mut sources = Vec::new();
    if node.has_attr("source") {
        sources.push("source");
    }
    if node.has_attr("datasource") {
        sources.push("datasource");
    }
    if !inline.is_empty() {
        sources.push("inline text");
    }
    if sources.len() > 1 {
        return Err(ParseError::attribute(
            NodeKind::Data,
            sources[1],
            "Data can only specify one source",
            node.attr_span(sources[1]),
        ));
    }

    let source = match sources.first().copied() {
        Some("source") => DataSourceSpec::Location(required_template(node, "source")?),
        Some("datasource") => DataSourceSpec::Variable(identifier_attr(node, "datasource")?),
        Some(_) => DataSourceSpec::Inline(inline.to_string()),
        None => {
            return Err(ParseError::attribute(
                NodeKind::Data,
                "source",
                "Data requires a source (source, datasource or inline text)",
                node.span,
            ))
        }
    };

    let format = match node.attr("type") {
        Some(raw) => Some(DataFormat::parse(raw).ok_or_else(|| {
            ParseError::attribute(
                NodeKind::Data,
                "type",
                format!("Data has unknown type '{}'", raw.trim()),
                node.attr_span("type"),
            )
        })?),
        None if matches!(source, DataSourceSpec::Variable(_)) => None,
        None => return Err(ParseError::missing_attribute(NodeKind::Data, "type", node.span)),
    };

    let fields = node
        .children_of(NodeKind::Field)
        .map(FieldSpec::from_node)
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(field) = node.children_of(NodeKind::Field).next() {
        if format != Some(DataFormat::Xml) {
            return Err(ParseError::structure(
                NodeKind::Field,
                "Field is only allowed in XML data",
                field.span,
            ));
        }
    }

    let options = match format {
        Some(format) => {
            let mut options = ImportOptions::new(format);
            if let Some(delimiter) = node.attr("delimiter") {
                let mut chars = delimiter.chars();
                options.delimiter = match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ if delimiter == "\\t" => '\t',
                    _ => {
                        return Err(ParseError::attribute(
                            NodeKind::Data,
                            "delimiter",
                            "Data delimiter must be a single character",
                            node.attr_span("delimiter"),
                        ))
                    }
                };
            }
            options.header = flag_attr(node, "header")?.unwrap_or(true);
            options.root = node.attr("root").map(|r| r.trim().to_string());
            options.item = node.attr("item").map(|i| i.trim().to_string());
            options.fields = fields;
            Some(options)
        }
        None => None,
    };

    Ok(TargetSpec::Import { source, options })
}

fn model_target(node: &Node) -> Result<TargetSpec, ParseError> {
    let messages = node
        .children_of(NodeKind::Message)
        .map(MessageSpec::from_node)
        .collect::<Result<Vec<_>, _>>()?;
    let prompt = template_attr(node, "prompt")?;
    if prompt.is_none() && messages.is_empty() {
        return Err(ParseError::attribute(
            NodeKind::Llm,
            "prompt",
            "Llm requires a prompt or messages",
            node.span,
        ));
    }
    let temperature = match node.attr("temperature") {
        Some(raw) => Some(raw.trim().parse::<f64>().ok().filter(|t| *t >= 0.0).ok_or_else(|| {
            ParseError::attribute(
                NodeKind::Llm,
                "temperature",
                "Llm attribute 'temperature' must be a non-negative number",
                node.attr_span("temperature"),
            )
        })?),
        None => None,
    };
    Ok(TargetSpec::Model {
        model: required_template(node, "model")?,
        system: template_attr(node, "system")?,
        prompt,
        messages,
        temperature,
        max_tokens: uint_attr(node, "max_tokens")?.map(|t| t.min(u32::MAX as u64) as u32),
    })
}

// =============================================================================
// POLICY
// =============================================================================

const AUTH_METHODS: [(&str, &[&str]); 4] = [
    ("bearer", &["token"]),
    ("apikey", &["api_key"]),
    ("basic", &["username", "password"]),
    ("oauth2", &["token_url", "client_id", "client_secret"]),
];

#[derive(Debug, Clone)]
pub enum AuthSpec {
    Bearer {
        token: Template,
    },
    ApiKey {
        key: Template,
        header: String,
    },
    Basic {
        username: Template,
        password: Template,
    },
    OAuth2 {
        token_url: Template,
        client_id: Template,
        client_secret: Template,
        scope: Option<Template>,
    },
}

impl AuthSpec {
    fn from_node(node: &Node) -> Result<Option<Self>, ParseError> {
        let with_credentials: Vec<&str> = AUTH_METHODS
            .iter()
            .filter(|(_, attrs)| attrs.iter().any(|a| node.has_attr(a)))
            .map(|(method, _)| *method)
            .collect();
        let one_method = || {
            ParseError::attribute(
                node.kind,
                "auth",
                format!("{} can only specify one auth method", node.kind),
                node.attr_span("auth"),
            )
        };

        let method = match node.attr("auth") {
            Some(raw) => {
                let method = raw.trim().to_ascii_lowercase();
                let Some((name, _)) = AUTH_METHODS.iter().find(|(m, _)| *m == method) else {
                    return Err(ParseError::attribute(
                        node.kind,
                        "auth",
                        format!("{} has unknown auth method '{}'", node.kind, raw.trim()),
                        node.attr_span("auth"),
                    ));
                };
                if with_credentials.iter().any(|m| m != name) {
                    return Err(one_method());
                }
                *name
            }
            None => match with_credentials.as_slice() {
                [] => return Ok(None),
                [one] => *one,
                _ => return Err(one_method()),
            },
        };

        let auth = match method {
            "bearer" => AuthSpec::Bearer {
                token: required_template(node, "token")?,
            },
            "apikey" => AuthSpec::ApiKey {
                key: required_template(node, "api_key")?,
                header: node
                    .attr("api_key_header")
                    .map(|h| h.trim().to_string())
                    .unwrap_or_else(|| "X-API-Key".to_string()),
            },
            "basic" => AuthSpec::Basic {
                username: required_template(node, "username")?,
                password: required_template(node, "password")?,
            },
            _ => AuthSpec::OAuth2 {
                token_url: required_template(node, "token_url")?,
                client_id: required_template(node, "client_id")?,
                client_secret: required_template(node, "client_secret")?,
                scope: template_attr(node, "scope")?,
            },
        };
        Ok(Some(auth))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicySpec {
    pub cache: bool,
    pub cache_key: Option<Template>,
    pub cache_ttl: Option<u64>,
    pub retry: Option<u32>,
    pub retry_delay: Option<u64>,
    pub timeout: Option<u64>,
    pub interval: Option<u64>,
    pub auth: Option<AuthSpec>,
}

impl PolicySpec {
    fn from_node(node: &Node, target: &TargetSpec) -> Result<Self, ParseError> {
        let retry = match uint_attr(node, "retry")? {
            Some(0) => {
                return Err(ParseError::attribute(
                    node.kind,
                    "retry",
                    format!("{} attribute 'retry' must be at least 1", node.kind),
                    node.attr_span("retry"),
                ))
            }
            Some(n) => Some(n.min(u32::MAX as u64) as u32),
            None => None,
        };

        let interval = uint_attr(node, "interval")?;
        if interval.is_some() && target.is_local() {
            return Err(ParseError::attribute(
                node.kind,
                "interval",
                format!("{} cannot poll a local target", node.kind),
                node.attr_span("interval"),
            ));
        }

        let auth = AuthSpec::from_node(node)?;
        if auth.is_some() && !matches!(target, TargetSpec::Http { .. }) {
            return Err(ParseError::attribute(
                node.kind,
                "auth",
                format!("{} auth requires an HTTP target", node.kind),
                node.attr_span("auth"),
            ));
        }

        let cache_key = template_attr(node, "cache_key")?;
        let cache_ttl = uint_attr(node, "cache_ttl")?;
        Ok(Self {
            cache: flag_attr(node, "cache")?.unwrap_or(false)
                || cache_key.is_some()
                || cache_ttl.is_some(),
            cache_key,
            cache_ttl,
            retry,
            retry_delay: uint_attr(node, "retry_delay")?,
            timeout: uint_attr(node, "timeout")?,
            interval,
            auth,
        })
    }
}

// =============================================================================
// SPEC
// =============================================================================

/// A validated I/O node
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub kind: NodeKind,
    pub name: Option<String>,
    pub target: TargetSpec,
    pub params: Vec<ParamSpec>,
    pub policy: PolicySpec,
    pub transforms: Vec<TransformStep>,
    pub span: SourceSpan,
}

impl OperationSpec {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let target = match node.kind {
            NodeKind::Query => {
                let statement = node.text_content().trim().to_string();
                if statement.is_empty() {
                    return Err(ParseError::structure(
                        NodeKind::Query,
                        "Query requires a statement",
                        node.span,
                    ));
                }
                TargetSpec::Sql {
                    datasource: required_template(node, "datasource")?,
                    statement,
                }
            }
            NodeKind::Data => data_target(node)?,
            NodeKind::Fetch => {
                let base = single_target(node, &["url", "endpoint", "service"])?;
                http_target(node, base)?
            }
            NodeKind::Invoke => {
                match single_target(node, &["function", "component", "url", "endpoint", "service"])? {
                    "function" => TargetSpec::Function(identifier_attr(node, "function")?),
                    "component" => TargetSpec::Component(identifier_attr(node, "component")?),
                    base => http_target(node, base)?,
                }
            }
            NodeKind::Llm => model_target(node)?,
            other => {
                return Err(ParseError::structure(
                    other,
                    format!("{} is not an operation", other),
                    node.span,
                ))
            }
        };

        let name = match node.kind {
            NodeKind::Query | NodeKind::Data => Some(identifier_attr(node, "name")?),
            _ if node.has_attr("name") => Some(identifier_attr(node, "name")?),
            _ => None,
        };

        let params = node
            .children_of(NodeKind::Param)
            .map(ParamSpec::from_node)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            kind: node.kind,
            name,
            policy: PolicySpec::from_node(node, &target)?,
            transforms: steps_of(node)?,
            target,
            params,
            span: node.span,
        })
    }

    pub fn is_local(&self) -> bool {
        self.target.is_local()
    }

    /// Evaluate against the current context
    pub fn resolve(&self, ctx: &ExecutionContext, config: &RuntimeConfig) -> Result<Resolved, RenderError> {
        let evaluator = Evaluator::new(ctx);
        let render = |t: &Template| {
            evaluator
                .render(t)
                .map_err(|e| RenderError::eval(e, self.span))
        };

        let mut ordered = Vec::new();
        for param in &self.params {
            let mut value = match &param.value {
                Some(value) => value
                    .evaluate(ctx)
                    .map_err(|e| RenderError::eval(e, param.span))?,
                None => Value::Undefined,
            };
            if value.is_undefined() {
                if let Some(default) = &param.default {
                    value = default
                        .evaluate(ctx)
                        .map_err(|e| RenderError::eval(e, param.span))?;
                }
            }
            if value.is_undefined() && param.required {
                let error = ParamError::Missing(param.name.clone());
                return Ok(Resolved::Rejected(OperationError::new(
                    ErrorKind::Validation,
                    error.to_string(),
                )));
            }
            match param.validate(value) {
                Ok(Value::Undefined) => {}
                Ok(value) => ordered.push((param.name.clone(), value)),
                Err(error) => {
                    let kind = match error {
                        ParamError::Type { .. } => ErrorKind::Type,
                        _ => ErrorKind::Validation,
                    };
                    return Ok(Resolved::Rejected(OperationError::new(kind, error.to_string())));
                }
            }
        }
        let args: BTreeMap<String, Value> = ordered.iter().cloned().collect();

        let target = match &self.target {
            TargetSpec::Function(name) => Target::Function(name.clone()),
            TargetSpec::Component(name) => Target::Component(name.clone()),
            TargetSpec::Http {
                base,
                path,
                method,
                body,
                headers,
                response_type,
            } => {
                let base = match base {
                    HttpBase::Url(url) => render(url)?,
                    HttpBase::Endpoint(endpoint) => match &config.http.base_url {
                        Some(root) => join_url(root, &render(endpoint)?),
                        None => {
                            return Ok(Resolved::Rejected(OperationError::new(
                                ErrorKind::TargetResolution,
                                "no http.base_url configured for endpoint targets",
                            )))
                        }
                    },
                    HttpBase::Service(name) => match config.services.get(name) {
                        Some(url) => url.clone(),
                        None => {
                            return Ok(Resolved::Rejected(OperationError::new(
                                ErrorKind::TargetResolution,
                                format!("Unknown service '{}'", name),
                            )))
                        }
                    },
                };
                let url = match path {
                    Some(path) => join_url(&base, &render(path)?),
                    None => base,
                };
                let method = method.clone().unwrap_or_else(|| {
                    if self.kind == NodeKind::Fetch {
                        "GET".to_string()
                    } else {
                        "POST".to_string()
                    }
                });

                let mut request = HttpRequest::new(method, url);
                for header in headers {
                    request
                        .headers
                        .push((header.name.clone(), render(&header.value)?));
                }
                match body {
                    Some(body) => request.body = Some(render(body)?),
                    None if ordered.is_empty() => {}
                    None if matches!(request.method.as_str(), "GET" | "DELETE" | "HEAD") => {
                        let query: Vec<String> = ordered
                            .iter()
                            .map(|(k, v)| {
                                format!("{}={}", urlencoding::encode(k), urlencoding::encode(&v.to_string()))
                            })
                            .collect();
                        let separator = if request.url.contains('?') { '&' } else { '?' };
                        request.url = format!("{}{}{}", request.url, separator, query.join("&"));
                    }
                    None => {
                        let json = Value::Object(args.clone()).to_json();
                        request.body = Some(json.to_string());
                        if request.header("content-type").is_none() {
                            request
                                .headers
                                .push(("Content-Type".to_string(), "application/json".to_string()));
                        }
                    }
                }
                Target::Http {
                    request,
                    response_type: *response_type,
                }
            }
            TargetSpec::Sql {
                datasource,
                statement,
            } => Target::Sql {
                datasource: render(datasource)?,
                statement: statement.clone(),
                params: ordered
                    .iter()
                    .map(|(name, value)| BoundParam {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            },
            TargetSpec::Import { source, options } => {
                let source = match source {
                    DataSourceSpec::Inline(text) => ImportSource::Inline(text.clone()),
                    DataSourceSpec::Variable(name) => ImportSource::Rows(ctx.resolve(name)),
                    DataSourceSpec::Location(location) => {
                        let location = render(location)?;
                        if location.starts_with("http://") || location.starts_with("https://") {
                            ImportSource::Url(location)
                        } else {
                            ImportSource::File(config.data_path(&location))
                        }
                    }
                };
                Target::Import {
                    source,
                    options: options.clone(),
                }
            }
            TargetSpec::Model {
                model,
                system,
                prompt,
                messages,
                temperature,
                max_tokens,
            } => {
                let mut chat = Vec::new();
                if let Some(system) = system {
                    chat.push(ChatMessage {
                        role: "system".to_string(),
                        content: render(system)?,
                    });
                }
                for message in messages {
                    chat.push(ChatMessage {
                        role: message.role.clone(),
                        content: render(&message.content)?,
                    });
                }
                if let Some(prompt) = prompt {
                    chat.push(ChatMessage {
                        role: "user".to_string(),
                        content: render(prompt)?,
                    });
                }
                Target::Model {
                    model: render(model)?,
                    messages: chat,
                    params: GenerationParams {
                        temperature: *temperature,
                        max_tokens: *max_tokens,
                    },
                }
            }
        };

        // Local calls read the caller's scope, so their args never identify the result
        let policy = &self.policy;
        let cache = if policy.cache && !target.is_local() {
            let key = match &policy.cache_key {
                Some(key) => render(key)?,
                None => fingerprint(self.kind, &target, &args),
            };
            let ttl = policy
                .cache_ttl
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.default_ttl());
            Some(CachePolicy { key, ttl })
        } else {
            None
        };

        let auth = match &policy.auth {
            Some(AuthSpec::Bearer { token }) => Some(Auth::Bearer(render(token)?)),
            Some(AuthSpec::ApiKey { key, header }) => Some(Auth::ApiKey {
                header: header.clone(),
                key: render(key)?,
            }),
            Some(AuthSpec::Basic { username, password }) => Some(Auth::Basic {
                username: render(username)?,
                password: render(password)?,
            }),
            Some(AuthSpec::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            }) => Some(Auth::OAuth2 {
                token_url: render(token_url)?,
                client_id: render(client_id)?,
                client_secret: render(client_secret)?,
                scope: scope.as_ref().map(&render).transpose()?,
            }),
            None => None,
        };

        let local = target.is_local();
        Ok(Resolved::Ready(Operation {
            kind: self.kind,
            name: self.name.clone(),
            args,
            policy: Policy {
                cache,
                max_attempts: policy
                    .retry
                    .unwrap_or(config.retry.max_attempts)
                    .max(1),
                retry_delay: Duration::from_millis(
                    policy.retry_delay.unwrap_or(config.retry.delay_ms),
                ),
                timeout: match policy.timeout {
                    Some(ms) => Some(Duration::from_millis(ms)),
                    None if local => None,
                    None => Some(config.http_timeout()),
                },
                interval: policy.interval.map(Duration::from_millis),
                auth,
            },
            transforms: self.transforms.clone(),
            target,
            span: self.span,
        }))
    }
}

fn join_url(base: &str, path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn fingerprint(kind: NodeKind, target: &Target, args: &BTreeMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.name().as_bytes());
    hasher.update(b"|");
    hasher.update(target.describe().as_bytes());
    hasher.update(b"|");
    hasher.update(Value::Object(args.clone()).to_json().to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

// =============================================================================
// RESOLVED OPERATIONS
// =============================================================================

/// Outcome of resolving a spec
#[derive(Debug, Clone)]
pub enum Resolved {
    Ready(Operation),
    /// Failed before the target was invoked
    Rejected(OperationError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportSource {
    Inline(String),
    File(PathBuf),
    Url(String),
    /// Rows (or a Result Object) already in scope
    Rows(Value),
}

#[derive(Debug, Clone)]
pub enum Target {
    Function(String),
    Component(String),
    Http {
        request: HttpRequest,
        response_type: ResponseType,
    },
    Sql {
        datasource: String,
        statement: String,
        params: Vec<BoundParam>,
    },
    Import {
        source: ImportSource,
        options: Option<ImportOptions>,
    },
    Model {
        model: String,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    },
}

impl Target {
    pub fn is_local(&self) -> bool {
        matches!(self, Target::Function(_) | Target::Component(_))
    }

    /// Short description used in logs and cache keys
    pub fn describe(&self) -> String {
        match self {
            Target::Function(name) => format!("function {}", name),
            Target::Component(name) => format!("component {}", name),
            Target::Http { request, .. } => format!(
                "{} {} {}",
                request.method,
                request.url,
                request.body.as_deref().unwrap_or_default()
            ),
            Target::Sql {
                datasource,
                statement,
                ..
            } => format!("sql {} {}", datasource, statement),
            Target::Import { source, .. } => match source {
                ImportSource::Inline(text) => format!("inline {}", text),
                ImportSource::File(path) => format!("file {}", path.display()),
                ImportSource::Url(url) => format!("url {}", url),
                ImportSource::Rows(rows) => format!("rows {}", rows),
            },
            Target::Model {
                model, messages, ..
            } => {
                let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
                format!("model {} {}", model, contents.join("\n"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub key: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    Bearer(String),
    ApiKey {
        header: String,
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub cache: Option<CachePolicy>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Applies to external targets only
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
    pub auth: Option<Auth>,
}

/// A fully evaluated operation
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: NodeKind,
    pub name: Option<String>,
    pub target: Target,
    /// Bound parameters by name
    pub args: BTreeMap<String, Value>,
    pub policy: Policy,
    pub transforms: Vec<TransformStep>,
    pub span: SourceSpan,
}

impl Operation {
    pub fn is_local(&self) -> bool {
        self.target.is_local()
    }
}
