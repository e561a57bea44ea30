//! OpenAPI export command.

use clap::Args;
use std::fs;
use std::path::PathBuf;
use utoipa::OpenApi;

use vmdisk::{ApiDoc, Error};

/// Export the OpenAPI document of the HTTP API.
#[derive(Args, Debug)]
pub struct OpenapiCmd {
    /// Output file path (defaults to stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// JSON format (OpenAPI 3.1)
    #[default]
    Json,
    /// YAML format (OpenAPI 3.1)
    Yaml,
}

impl OpenapiCmd {
    /// Execute the openapi command.
    pub fn run(&self) -> vmdisk::Result<()> {
        let doc = ApiDoc::openapi();

        let output = match self.format {
            OutputFormat::Json => doc
                .to_pretty_json()
                .map_err(|e| Error::Config(format!("serialize openapi to json: {}", e)))?,
            OutputFormat::Yaml => serde_yaml::to_string(&doc)
                .map_err(|e| Error::Config(format!("serialize openapi to yaml: {}", e)))?,
        };

        match &self.output {
            Some(path) => {
                fs::write(path, &output)?;
                eprintln!("OpenAPI document written to {}", path.display());
            }
            None => println!("{}", output),
        }

        Ok(())
    }
}
