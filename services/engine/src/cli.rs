//! Command-line surface.
//!
//! The broker invokes one command per process with a JSON input document and
//! reads one JSON response back from stdout.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::input::{self, MachinesInput, ProvisionInput, StatusInput};
use crate::response::Response;

/// hostprov - provision and reclaim compute instances for a resource broker.
#[derive(Debug, Parser)]
#[command(name = "hostprov")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Input document as inline JSON.
    #[arg(long, global = true, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Input document read from a file.
    #[arg(long, global = true)]
    pub input_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// List the templates machines can be requested from.
    #[command(alias = "getAvailableTemplates")]
    Templates,

    /// Launch machines from a template.
    #[command(alias = "requestMachines")]
    RequestMachines,

    /// Poll create and return requests.
    #[command(alias = "getRequestStatus")]
    RequestStatus,

    /// Hand machines back for termination.
    #[command(alias = "requestReturnMachines")]
    RequestReturnMachines,

    /// Report machines the provider is reclaiming or has removed.
    #[command(alias = "getReturnRequests")]
    ReturnRequests,
}

impl Command {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Templates => "getAvailableTemplates",
            Self::RequestMachines => "requestMachines",
            Self::RequestStatus => "getRequestStatus",
            Self::RequestReturnMachines => "requestReturnMachines",
            Self::ReturnRequests => "getReturnRequests",
        }
    }

    /// Whether the command cannot run without a template catalog.
    pub fn needs_templates(&self) -> bool {
        matches!(self, Self::Templates | Self::RequestMachines)
    }

    /// Whether the command reads an input document.
    pub fn takes_input(&self) -> bool {
        !matches!(self, Self::Templates)
    }
}

impl Cli {
    /// The raw input document, or `None` when none was given.
    pub fn read_input(&self) -> Result<Option<String>, EngineError> {
        if let Some(raw) = &self.input {
            return Ok(Some(raw.clone()));
        }
        match &self.input_file {
            Some(path) => std::fs::read_to_string(path).map(Some).map_err(|e| {
                EngineError::InvalidInput(format!("failed to read {}: {e}", path.display()))
            }),
            None => Ok(None),
        }
    }
}

/// Run `command` against `engine`, folding every failure into a response.
pub async fn dispatch(engine: &Engine, command: Command, raw_input: Option<&str>) -> Response {
    info!(command = command.as_str(), "Running command");

    let result = run(engine, command, raw_input).await;
    match result {
        Ok(response) => response,
        Err(err) => {
            error!(
                command = command.as_str(),
                reason = err.reason_code(),
                error = %err,
                "Command failed"
            );
            Response::from_error(&err)
        }
    }
}

async fn run(engine: &Engine, command: Command, raw_input: Option<&str>) -> Result<Response, EngineError> {
    if !command.takes_input() {
        return Ok(engine.get_available_templates());
    }

    let raw = raw_input.filter(|raw| !raw.trim().is_empty()).ok_or_else(|| {
        EngineError::InvalidInput(format!("{} needs an input document", command.as_str()))
    })?;

    match command {
        Command::Templates => Ok(engine.get_available_templates()),
        Command::RequestMachines => {
            let input: ProvisionInput = input::parse(raw)?;
            engine.request_machines(&input).await
        }
        Command::RequestStatus => {
            let input: StatusInput = input::parse(raw)?;
            engine.get_request_status(&input).await
        }
        Command::RequestReturnMachines => {
            let input: MachinesInput = input::parse(raw)?;
            engine.request_return_machines(&input).await
        }
        Command::ReturnRequests => {
            let input: MachinesInput = input::parse(raw)?;
            engine.get_return_requests(&input).await
        }
    }
}
