use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::io::{self, BufRead, Write};
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskpilot::{
    Agent, CuaClient, CuaConfig, Endpoint, Executor, RemoteSurface, SurfaceConfig,
};

const AZURE_API_VERSION: &str = "2025-03-01-preview";

/// Supplementary behavioral instructions prepended to the task text when
/// enhanced instructions are enabled.
const COMPUTER_USE_INSTRUCTIONS: &str = r#"
# Computer Use Instructions for LLM Model

## General Principles
- Always analyze the current screen state before taking any action
- Plan a sequence of steps before executing complex tasks
- Prioritize speed when interacting with UI elements

## Navigation Best Practices
- Use direct clicks on navigation elements rather than typing URLs when possible
- Identify and use keyboard shortcuts when available (Cmd+C/Ctrl+C for copy, Cmd+V/Ctrl+V for paste, etc.)
- Use Tab to navigate through form fields efficiently
- Scroll slowly and incrementally when scanning for information, trying using keyboard shortcuts for page up and page down when possible instead of scrolling when possible.

## UI Interaction Guidelines
- Click on the center of buttons and interactive elements
- Double-check text input before submitting forms
- Use appropriate waits between actions that trigger UI changes (loading screens, animations)
- When encountering dropdown menus, fully expand them before making a selection

## Error Handling
- If an action doesn't produce the expected result, try an alternative approach
- Recognize common error messages and respond appropriately
- When faced with an unexpected popup, carefully read its content before deciding how to proceed
- If navigation leads to a wrong page, use browser back buttons or home navigation to reorient

## Efficiency Techniques
- Utilize search functions within applications when available
- Use context menus (right-click) to access additional options
- Break complex tasks into smaller, manageable segments
- Recognize when a task can be achieved through keyboard shortcuts instead of mouse interactions

## Platform-Specific Considerations
- On macOS: Use Cmd for keyboard shortcuts (Cmd+Space for Spotlight, Cmd+Tab for app switching)
- On Windows: Use Ctrl for most shortcuts, Windows key for system functions
- On web browsers: Check for browser-specific features (Chrome omnibox, Firefox add-ons)
- On mobile interfaces: Adapt to touch-based interactions and consider screen size limitations
"#;

#[derive(Parser, Debug)]
#[command(name = "deskpilot", about = "Drive a remote desktop with a computer-use model")]
struct Args {
    /// Task to perform; an empty string prompts interactively.
    #[arg(long, default_value = "Open web browser and go to microsoft.com.")]
    instructions: String,

    #[arg(long, default_value = "computer-use-preview")]
    model: String,

    /// Reasoning back-end: "azure" or "openai".
    #[arg(long, default_value = "azure")]
    endpoint: Endpoint,

    /// Run actions without confirmation ("--autoplay false" to gate them).
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    autoplay: bool,

    /// Platform label of the remote machine: "Windows", "Darwin" or "Linux".
    #[arg(long, default_value = "Darwin")]
    environment: String,

    /// Prepend the fixed computer-use instruction block to the task.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    enhanced_instructions: bool,
}

fn prompt(text: &str) -> Result<String> {
    print!("{text}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn provider_config(args: &Args) -> Result<CuaConfig> {
    let cfg = match args.endpoint {
        Endpoint::Azure => CuaConfig {
            endpoint: Endpoint::Azure,
            api_base: std::env::var("AZURE_OPENAI_ENDPOINT")
                .context("AZURE_OPENAI_ENDPOINT not set")?,
            api_key: std::env::var("AZURE_OPENAI_API_KEY")
                .context("AZURE_OPENAI_API_KEY not set")?,
            api_version: AZURE_API_VERSION.to_string(),
            model: args.model.clone(),
        },
        Endpoint::OpenAi => CuaConfig {
            endpoint: Endpoint::OpenAi,
            api_base: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?,
            api_version: String::new(),
            model: args.model.clone(),
        },
    };
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let provider = CuaClient::new(provider_config(&args)?)?;
    let surface = RemoteSurface::connect(SurfaceConfig {
        base_url: std::env::var("SURFACE_URL").context("SURFACE_URL not set")?,
        api_key: std::env::var("SURFACE_API_KEY").ok(),
        os_label: args.environment.clone(),
    })
    .await?;
    let executor = Executor::new(surface);
    let mut agent = Agent::new(provider, executor, args.autoplay);

    let mut user_input = if args.instructions.is_empty() {
        prompt("Please enter the initial task: ")?
    } else {
        args.instructions.clone()
    };
    if args.enhanced_instructions {
        user_input = format!("{COMPUTER_USE_INSTRUCTIONS}\n\nUser Task: {user_input}");
        info!("using enhanced computer use instructions");
    }
    info!("User: {user_input}");

    agent.start_task();
    loop {
        if user_input.is_empty() && agent.requires_user_input {
            println!();
            user_input = prompt("User: ")?;
        }
        agent.continue_task(&user_input).await?;
        user_input.clear();

        if !args.autoplay {
            if !agent.pending_safety_checks.is_empty() {
                println!("Safety checks: {:?}", agent.pending_safety_checks);
                prompt("Press Enter to acknowledge and continue...")?;
                agent.acknowledge().await?;
            } else if agent.requires_consent {
                prompt("Press Enter to run computer tool...")?;
                agent.acknowledge().await?;
            }
        }

        if !agent.reasoning_summary.is_empty() {
            println!();
            println!("Action: {}", agent.reasoning_summary);
        }
        for call in agent.actions() {
            println!("  {:?}", call.action);
        }
        if !agent.messages.is_empty() {
            println!();
            println!("Agent: {}", agent.messages.join(""));
        }
    }
}
