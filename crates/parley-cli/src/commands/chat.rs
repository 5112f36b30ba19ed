use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::style;
use futures::StreamExt;
use parley::backends::factory::BackendRegistry;
use parley::config::Settings;
use parley::models::event::CanonicalEvent;
use parley::models::message::{Conversation, Message};
use parley::models::request::{Capability, RequestContext, RequestHints};
use parley::models::usage::Usage;
use parley::orchestrator::{Orchestrator, Outcome};
use parley::prompt::PromptBuilder;
use parley::protocol::ProtocolFormatter;
use parley::sink::EventSink;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Model id to invoke; unknown ids use the configured default
    #[arg(short, long, default_value = "chat-model")]
    pub model: String,

    #[arg(long)]
    pub city: Option<String>,

    #[arg(long)]
    pub country: Option<String>,

    #[arg(long, allow_hyphen_values = true)]
    pub latitude: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    pub longitude: Option<f64>,

    /// Enable a tool capability (repeatable)
    #[arg(long = "capability", value_parser = parse_capability)]
    pub capabilities: Vec<Capability>,

    /// Print wire events instead of text
    #[arg(long)]
    pub json: bool,

    /// The message to send
    pub message: String,
}

impl ChatArgs {
    fn context(&self) -> RequestContext {
        let hints = RequestHints {
            latitude: self.latitude,
            longitude: self.longitude,
            city: self.city.clone(),
            country: self.country.clone(),
        };
        self.capabilities
            .iter()
            .fold(RequestContext::new(&self.model).with_hints(hints), |ctx, c| {
                ctx.with_capability(*c)
            })
    }
}

fn parse_capability(value: &str) -> Result<Capability, String> {
    Capability::from_str(value).map_err(|_| {
        let known: Vec<String> = Capability::iter().map(|c| c.to_string()).collect();
        format!("unknown capability '{}', expected one of: {}", value, known.join(", "))
    })
}

fn usage_line(usage: &Usage) -> String {
    let count = |n: Option<i32>| n.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string());
    format!(
        "tokens: {} in, {} out, {} total",
        count(usage.input_tokens),
        count(usage.output_tokens),
        count(usage.total_tokens)
    )
}

pub async fn execute(args: ChatArgs) -> Result<()> {
    let settings = Settings::new()?;
    let registry = Arc::new(BackendRegistry::from_settings(&settings)?);
    let prompts = Arc::new(PromptBuilder::from_settings(&settings.prompt)?);
    let orchestrator = Orchestrator::from_settings(registry, prompts, &settings);

    let conversation = Conversation::new(vec![Message::user().with_text(args.message.clone())]);
    let ctx = args.context();
    let (sink, mut events) = EventSink::channel(settings.stream.channel_capacity);
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let invocation = tokio::spawn(async move {
        orchestrator.run(&conversation, &ctx, sink, cancel).await
    });

    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        if args.json {
            println!("{}", ProtocolFormatter::to_json(&event));
            continue;
        }
        match &event {
            CanonicalEvent::TextDelta(delta) => print!("{}", delta),
            CanonicalEvent::Error(message) => print!("\n{}", style(message).red()),
            _ => {}
        }
        stdout.flush()?;
    }

    let completion = invocation.await?;
    if !args.json {
        println!();
        if let Some(usage) = &completion.usage {
            println!("{}", style(usage_line(usage)).dim());
        }
        if completion.outcome == Outcome::Cancelled {
            println!("{}", style("cancelled").yellow());
        }
    }
    Ok(())
}
