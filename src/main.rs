// src/main.rs
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use promptweave::core::tool_loader::ScriptToolDefinition;
use promptweave::{
    EngineConfig, PromptRegistry, ReferenceResolver, ReferenceValidator, ScriptRegistry, TemplateSource,
    TriggerDetector, ValidationError, VerificationCheck,
};

#[derive(Parser)]
#[command(name = "promptweave", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./promptweave.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve references and render a prompt
    Render {
        /// Prompt id
        id: String,
        /// Variables as a JSON object
        #[arg(long)]
        vars: Option<String>,
        /// Read variables from a JSON file
        #[arg(long)]
        vars_file: Option<PathBuf>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Statically validate prompt references without running scripts
    Check {
        /// Only check this prompt (defaults to all)
        id: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List registered script tools
    Scripts {
        /// Include template-local scripts of this prompt
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Show which scripts would fire for the given input
    Detect {
        /// Prompt whose declared scripts are candidates (defaults to every workspace script)
        #[arg(long)]
        prompt: Option<String>,
        /// Raw user input
        #[arg(short, long, default_value = "")]
        input: String,
        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// Run shell verification checks (exit 0 passes)
    Verify {
        /// Commands to run
        commands: Vec<String>,
        /// JSON file with a list of checks
        #[arg(long)]
        checks: Option<PathBuf>,
        /// Working directory for the checks
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
}

/// Everything a subcommand needs, built once from config.
struct Workspace {
    config: EngineConfig,
    prompts: Arc<PromptRegistry>,
    scripts: Arc<ScriptRegistry>,
}

impl Workspace {
    fn open(config: EngineConfig) -> Result<Self> {
        let prompts = Arc::new(PromptRegistry::new());
        let loaded = prompts.load_from_paths(&config.prompt_patterns())?;
        info!("📂 Workspace {} ({} prompts)", config.workspace.root.display(), loaded);
        let scripts = Arc::new(ScriptRegistry::new(config.workspace.root.clone()));
        Ok(Self {
            config,
            prompts,
            scripts,
        })
    }

    fn resolver(&self) -> ReferenceResolver {
        ReferenceResolver::new(self.prompts.clone(), self.scripts.clone())
            .with_options(self.config.resolver_options())
            .with_executor(self.config.script_executor())
    }

    fn owner_dir(&self, prompt_id: Option<&str>) -> Result<Option<PathBuf>> {
        match prompt_id {
            Some(id) => {
                let template = self
                    .prompts
                    .find_by_id(id)
                    .ok_or_else(|| anyhow!("Prompt '{}' not found", id))?;
                Ok(Some(template.dir.clone()))
            }
            None => Ok(None),
        }
    }
}

fn parse_object(raw: Option<&str>, file: Option<&Path>) -> Result<Map<String, Value>> {
    let text = match (raw, file) {
        (Some(_), Some(_)) => return Err(anyhow!("Use either inline JSON or a file, not both")),
        (Some(raw), None) => raw.to_string(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => return Ok(Map::new()),
    };
    match serde_json::from_str::<Value>(&text).context("Invalid JSON")? {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("Expected a JSON object")),
    }
}

async fn handle_render(ws: &Workspace, id: &str, vars: Map<String, Value>, format: &str) -> Result<()> {
    let outcome = ws.resolver().resolve_template(id, &vars).await?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for warning in &outcome.diagnostics.warnings {
            eprintln!("\x1b[33mwarning\x1b[0m: {}", warning);
        }
        println!("{}", outcome.rendered_body);
    }
    Ok(())
}

fn handle_check(ws: &Workspace, id: Option<&str>, format: &str) -> Result<()> {
    let (ids, findings) = match id {
        Some(id) => {
            let template = ws
                .prompts
                .find_by_id(id)
                .ok_or_else(|| anyhow!("Prompt '{}' not found", id))?;
            let errors = ReferenceValidator::validate(id, &template.body(), ws.prompts.as_ref());
            (vec![id.to_string()], BTreeMap::from([(id.to_string(), errors)]))
        }
        None => (ws.prompts.ids(), ReferenceValidator::validate_all(ws.prompts.as_ref())),
    };

    let mut problems = 0;
    let mut report = Vec::new();
    for id in &ids {
        let Some(template) = ws.prompts.find_by_id(id) else {
            continue;
        };
        let errors: &[ValidationError] = findings.get(id).map(Vec::as_slice).unwrap_or_default();
        let missing_tools: Vec<&String> = template
            .tools
            .iter()
            .filter(|tool| !ws.scripts.exists(tool, Some(template.dir.as_path())))
            .collect();
        problems += errors.len() + missing_tools.len();

        if format == "json" {
            report.push(json!({"id": id, "errors": errors, "missing_scripts": missing_tools}));
            continue;
        }
        if errors.is_empty() && missing_tools.is_empty() {
            println!("    \x1b[1;32m✓\x1b[0m {}", id);
        } else {
            println!("    \x1b[1;31m✗\x1b[0m {}", id);
            for e in errors {
                println!("        {}", e);
            }
            for tool in &missing_tools {
                println!("        Declared script '{}' is not registered", tool);
            }
        }
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n    Checked {} prompts, {} problems", ids.len(), problems);
    }

    if problems > 0 {
        return Err(anyhow!("{} problems found", problems));
    }
    Ok(())
}

fn serde_label<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn load_definitions(ws: &Workspace, owner: Option<&Path>) -> Vec<Arc<ScriptToolDefinition>> {
    ws.scripts
        .discover(owner)
        .iter()
        .filter_map(|id| ws.scripts.load(id, owner))
        .collect()
}

fn handle_scripts(ws: &Workspace, prompt: Option<&str>) -> Result<()> {
    let owner = ws.owner_dir(prompt)?;
    let ids = ws.scripts.discover(owner.as_deref());
    if ids.is_empty() {
        println!("    \x1b[33mNo scripts found\x1b[0m");
        return Ok(());
    }

    for id in ids {
        match ws.scripts.load(&id, owner.as_deref()) {
            Some(def) => println!(
                "    {:<24} {:<10} {:<13} {}{}",
                def.id,
                serde_label(&def.source),
                serde_label(&def.execution.trigger),
                def.name,
                if def.enabled { "" } else { " (disabled)" }
            ),
            None => println!("    {:<24} \x1b[31minvalid definition\x1b[0m", id),
        }
    }

    let stats = ws.scripts.stats();
    debug!("Registry stats: {:?}", stats);
    println!(
        "\n    {} local, {} workspace, {} rejected",
        stats.local_loads, stats.workspace_loads, stats.load_errors
    );
    Ok(())
}

fn handle_detect(ws: &Workspace, prompt: Option<&str>, input: &str, args: Map<String, Value>) -> Result<()> {
    let candidates: Vec<Arc<ScriptToolDefinition>> = match prompt {
        Some(id) => {
            let template = ws
                .prompts
                .find_by_id(id)
                .ok_or_else(|| anyhow!("Prompt '{}' not found", id))?;
            template
                .tools
                .iter()
                .filter_map(|tool| ws.scripts.load(tool, Some(template.dir.as_path())))
                .collect()
        }
        None => load_definitions(ws, None),
    };

    let matches = TriggerDetector::new().detect(input, &args, &candidates);
    println!("{}", serde_json::to_string_pretty(&matches)?);
    Ok(())
}

async fn handle_verify(ws: &Workspace, commands: &[String], checks_file: Option<&Path>, cwd: Option<&Path>) -> Result<()> {
    let mut checks: Vec<VerificationCheck> = commands
        .iter()
        .map(|c| VerificationCheck::new(c.clone(), c.clone()))
        .collect();
    if let Some(path) = checks_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let from_file: Vec<VerificationCheck> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checks in {}", path.display()))?;
        checks.extend(from_file);
    }
    if checks.is_empty() {
        return Err(anyhow!("No checks given"));
    }

    let summary = ws.config.shell_verifier().run_checks(&checks, cwd).await;
    for outcome in &summary.checks {
        let mark = if outcome.result.passed {
            "\x1b[1;32mPASS\x1b[0m"
        } else if outcome.required {
            "\x1b[1;31mFAIL\x1b[0m"
        } else {
            "\x1b[33mWARN\x1b[0m"
        };
        println!("    {} {} ({} ms)", mark, outcome.name, outcome.result.duration_ms);
        if !outcome.result.passed && !outcome.result.stderr.trim().is_empty() {
            for line in outcome.result.stderr.trim().lines() {
                println!("        {}", line);
            }
        }
    }

    if !summary.passed {
        return Err(anyhow!("Verification failed"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };

    let default_filter = if cli.verbose {
        "promptweave=debug".to_string()
    } else {
        config
            .logging
            .filter
            .clone()
            .unwrap_or_else(|| "promptweave=info".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ws = Workspace::open(config)?;

    match &cli.command {
        Commands::Render {
            id,
            vars,
            vars_file,
            format,
        } => {
            let vars = parse_object(vars.as_deref(), vars_file.as_deref())?;
            handle_render(&ws, id, vars, format).await?
        }
        Commands::Check { id, format } => handle_check(&ws, id.as_deref(), format)?,
        Commands::Scripts { prompt } => handle_scripts(&ws, prompt.as_deref())?,
        Commands::Detect { prompt, input, args } => {
            let args = parse_object(args.as_deref(), None)?;
            handle_detect(&ws, prompt.as_deref(), input, args)?
        }
        Commands::Verify {
            commands,
            checks,
            cwd,
        } => handle_verify(&ws, commands, checks.as_deref(), cwd.as_deref()).await?,
    }

    Ok(())
}
