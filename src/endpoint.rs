//! Endpoint URIs and the source/sink factory.
//!
//! Endpoints are written `scheme://target`. Schemes: `file`, `tcp`,
//! `listen`, `std`, `empty`, `http`, plus the format-forcing `csv` and
//! `bin`. Without a scheme the target decides: `-` is stdio, `:port`
//! listens, `host:port` dials, anything else is a file path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::marshal::Format;
use crate::processor::{DropProcessor, Processor};
use crate::sink::{FileSink, StdoutSink, TcpListenerSink, TcpSink};
use crate::source::{
    EmptySource, FileSource, SampleSource, StdinSource, TcpListenerSource, TcpSource,
};

/// The transport class of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    /// A file path.
    File,
    /// A TCP dial target.
    Tcp,
    /// A TCP bind address.
    TcpListen,
    /// Standard input/output.
    Std,
    /// The synthetic empty endpoint.
    Empty,
    /// An HTTP endpoint; resolved only through a registered custom hook.
    Http,
}

/// A parsed endpoint specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Transport class.
    pub typ: EndpointType,
    /// Explicit wire format, when a format scheme forced one.
    pub format: Option<Format>,
    /// The target part (path, address, `-`).
    pub target: String,
    /// The specifier as written, for error messages.
    pub original: String,
}

impl Endpoint {
    /// The wire format for this endpoint: the forced one, or the
    /// transport's default (text for files and stdio, binary for TCP).
    pub fn effective_format(&self) -> Format {
        self.format.unwrap_or(match self.typ {
            EndpointType::File | EndpointType::Std | EndpointType::Empty => Format::Csv,
            EndpointType::Tcp | EndpointType::TcpListen | EndpointType::Http => Format::Binary,
        })
    }
}

type CustomSourceFn =
    Box<dyn Fn(&Endpoint, &PipelineConfig) -> Result<Arc<dyn SampleSource>, PipelineError> + Send + Sync>;
type CustomSinkFn =
    Box<dyn Fn(&Endpoint, &PipelineConfig) -> Result<Arc<dyn Processor>, PipelineError> + Send + Sync>;

/// Parses endpoint specifiers and constructs the matching sources and
/// sinks.
///
/// Hosts can register custom handlers for additional schemes (`http`, or
/// project-specific ones); unknown schemes without a handler fail with an
/// endpoint error.
pub struct EndpointFactory {
    config: PipelineConfig,
    custom_sources: HashMap<String, CustomSourceFn>,
    custom_sinks: HashMap<String, CustomSinkFn>,
}

impl EndpointFactory {
    /// Creates a factory with the given runtime configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            custom_sources: HashMap::new(),
            custom_sinks: HashMap::new(),
        }
    }

    /// The configuration sources and sinks are built with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Registers a source constructor for a custom scheme.
    pub fn register_custom_source(&mut self, scheme: impl Into<String>, f: CustomSourceFn) {
        self.custom_sources.insert(scheme.into(), f);
    }

    /// Registers a sink constructor for a custom scheme.
    pub fn register_custom_sink(&mut self, scheme: impl Into<String>, f: CustomSinkFn) {
        self.custom_sinks.insert(scheme.into(), f);
    }

    /// Returns `true` when the scheme has a custom handler.
    fn is_custom(&self, scheme: &str) -> bool {
        self.custom_sources.contains_key(scheme) || self.custom_sinks.contains_key(scheme)
    }

    /// Parses one endpoint specifier.
    pub fn parse_endpoint(&self, spec: &str) -> Result<Endpoint, PipelineError> {
        if let Some((scheme, target)) = spec.split_once("://") {
            let endpoint = |typ| Endpoint {
                typ,
                format: None,
                target: target.to_string(),
                original: spec.to_string(),
            };
            return match scheme {
                "file" => Ok(endpoint(EndpointType::File)),
                "tcp" => Ok(endpoint(EndpointType::Tcp)),
                "listen" => Ok(endpoint(EndpointType::TcpListen)),
                "std" => Ok(endpoint(EndpointType::Std)),
                "empty" => Ok(endpoint(EndpointType::Empty)),
                "http" => Ok(endpoint(EndpointType::Http)),
                "csv" | "bin" => {
                    let format = if scheme == "csv" {
                        Format::Csv
                    } else {
                        Format::Binary
                    };
                    let mut inferred = self.infer(target, spec);
                    inferred.format = Some(format);
                    Ok(inferred)
                }
                custom if self.is_custom(custom) => Ok(endpoint(EndpointType::Http)),
                unknown => Err(PipelineError::endpoint(
                    spec,
                    format!("unknown scheme '{unknown}'"),
                )),
            };
        }
        Ok(self.infer(spec, spec))
    }

    /// Infers the transport from a bare target.
    fn infer(&self, target: &str, original: &str) -> Endpoint {
        let typ = if target == "-" {
            EndpointType::Std
        } else if let Some(port) = target.strip_prefix(':') {
            if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() {
                EndpointType::TcpListen
            } else {
                EndpointType::File
            }
        } else if looks_like_host_port(target) {
            EndpointType::Tcp
        } else {
            EndpointType::File
        };
        Endpoint {
            typ,
            format: None,
            target: target.to_string(),
            original: original.to_string(),
        }
    }

    /// Builds one source reading all given endpoints simultaneously.
    ///
    /// All endpoints of one input must share transport and format: file
    /// inputs become one multi-file source, TCP inputs one multi-remote
    /// dialer.
    pub fn create_source(&self, specs: &[String]) -> Result<Arc<dyn SampleSource>, PipelineError> {
        let first_spec = specs
            .first()
            .ok_or_else(|| PipelineError::Config("input without endpoints".into()))?;
        let endpoints: Vec<Endpoint> = specs
            .iter()
            .map(|spec| self.parse_endpoint(spec))
            .collect::<Result<_, _>>()?;

        let first = &endpoints[0];
        if endpoints
            .iter()
            .any(|e| e.typ != first.typ || e.effective_format() != first.effective_format())
        {
            return Err(PipelineError::endpoint(
                first_spec,
                "all endpoints of one input must share transport and format",
            ));
        }

        if let Some((scheme, _)) = first.original.split_once("://") {
            if let Some(custom) = self.custom_sources.get(scheme) {
                return custom(first, &self.config);
            }
        }

        let marshaller = first.effective_format().marshaller();
        let handler = self.config.parallel.clone();
        match first.typ {
            EndpointType::File => {
                let paths: Vec<PathBuf> =
                    endpoints.iter().map(|e| PathBuf::from(&e.target)).collect();
                Ok(Arc::new(FileSource::new(paths, marshaller, handler)))
            }
            EndpointType::Tcp => {
                let remotes: Vec<String> = endpoints.iter().map(|e| e.target.clone()).collect();
                Ok(Arc::new(TcpSource::new(remotes, marshaller, &self.config)))
            }
            EndpointType::TcpListen => {
                if endpoints.len() > 1 {
                    return Err(PipelineError::endpoint(
                        first_spec,
                        "only one listen endpoint per input",
                    ));
                }
                Ok(Arc::new(TcpListenerSource::new(
                    first.target.clone(),
                    marshaller,
                    &self.config,
                )))
            }
            EndpointType::Std => Ok(Arc::new(StdinSource::new(marshaller, handler))),
            EndpointType::Empty => Ok(Arc::new(EmptySource::new())),
            EndpointType::Http => Err(PipelineError::endpoint(
                first_spec,
                "http inputs need a registered custom endpoint handler",
            )),
        }
    }

    /// Builds one terminal sink processor for the given endpoint.
    pub fn create_sink(&self, spec: &str) -> Result<Arc<dyn Processor>, PipelineError> {
        let endpoint = self.parse_endpoint(spec)?;

        if let Some((scheme, _)) = endpoint.original.split_once("://") {
            if let Some(custom) = self.custom_sinks.get(scheme) {
                return custom(&endpoint, &self.config);
            }
        }

        let marshaller = endpoint.effective_format().marshaller();
        let handler = self.config.parallel.clone();
        match endpoint.typ {
            EndpointType::File => Ok(Arc::new(FileSink::new(
                PathBuf::from(&endpoint.target),
                marshaller,
                handler,
            ))),
            EndpointType::Tcp => Ok(Arc::new(TcpSink::new(
                endpoint.target,
                marshaller,
                &self.config,
            ))),
            EndpointType::TcpListen => Ok(Arc::new(TcpListenerSink::new(
                endpoint.target,
                marshaller,
                &self.config,
            ))),
            EndpointType::Std => Ok(Arc::new(StdoutSink::new(marshaller, handler))),
            EndpointType::Empty => Ok(Arc::new(DropProcessor::new())),
            EndpointType::Http => Err(PipelineError::endpoint(
                spec,
                "http outputs need a registered custom endpoint handler",
            )),
        }
    }
}

/// A bare `host:port` target: one colon, non-empty host, numeric port.
fn looks_like_host_port(target: &str) -> bool {
    match target.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && !host.contains('/')
                && !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
