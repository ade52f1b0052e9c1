//! A tool-calling agent with a two-number adder.
//!
//! The iteration budget comes from `AGENT_MAX_ITERATIONS` (default 5).

use std::sync::Arc;

use anyhow::Context;
use llm_runnables::{
    config::Settings, AgentLoop, AgentOutcome, Event, ExhaustionPolicy, FnEventHandler, FnTool,
    ToolRegistry,
};
use tracing_subscriber::EnvFilter;

fn add(input: &str) -> anyhow::Result<String> {
    let (a, b) = input
        .split_once(',')
        .context("expected input of the form 'a,b', e.g. '5,3'")?;
    let a: f64 = a.trim().parse().context("first operand is not a number")?;
    let b: f64 = b.trim().parse().context("second operand is not a number")?;
    Ok(format!("{} + {} = {}", a, b, a + b))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env()?;
    let mut ctx = settings.exec_ctx()?;
    ctx.event_handler = Some(Arc::new(FnEventHandler(|event| match event {
        Event::AgentIteration {
            iteration,
            max_iterations,
        } => eprintln!("[iteration {}/{}]", iteration + 1, max_iterations),
        Event::ToolInvoked { tool, input } => eprintln!("  -> {}({})", tool, input),
        Event::ToolFinished { tool, status } => eprintln!("  <- {} [{}]", tool, status.as_str()),
        _ => {}
    })));

    let registry = ToolRegistry::new().with(FnTool::new(
        "calculator_add",
        "Adds two numbers. Input format: 'number1,number2', for example '5,3'.",
        add,
    ))?;

    let agent = AgentLoop::new(
        settings.chat_model().with_name("calculator"),
        registry,
        settings.max_iterations,
        ExhaustionPolicy::ReturnPartial,
    )
    .with_system_prompt("You are a careful assistant. Use the calculator for every addition.");

    let question = "What is 12.5 plus 30, and then that result plus 7?";
    println!("Q: {}\n", question);

    match agent.run(&ctx, question).await? {
        AgentOutcome::Done {
            answer, iterations, ..
        } => println!("A: {}\n({} tool rounds)", answer, iterations),
        AgentOutcome::Exhausted {
            partial_answer,
            iterations,
            ..
        } => println!(
            "Gave up after {} iterations. Partial answer: {}",
            iterations,
            partial_answer.as_deref().unwrap_or("<none>")
        ),
    }

    Ok(())
}
