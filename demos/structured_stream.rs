//! Stream a naming prompt through the model, printing fragments as they
//! arrive, then parse the joined reply into a record.
//!
//! Reads `LLM_BASE_URL`, `LLM_API_KEY` and `LLM_MODEL` (a `.env` file works).

use std::io::Write;
use std::sync::Arc;

use llm_runnables::{
    compose,
    config::Settings,
    output_parser::{Schema, StructuredParser},
    prompt::{vars, PromptTemplate},
    stream_into, Event, FnEventHandler, Stage,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env()?;
    let mut ctx = settings.exec_ctx()?;
    ctx.event_handler = Some(Arc::new(FnEventHandler(|event| {
        if let Event::Token { chunk, .. } = event {
            eprint!("{}", chunk);
            let _ = std::io::stderr().flush();
        }
    })));

    let schema = Schema::builder()
        .field("names", "three generated names, separated by commas")
        .field("county", "the regional flavour of the names")
        .field("boyInspiration", "where the boy's name comes from")
        .field("girlInspiration", "where the girl's name comes from")
        .build()?;
    let parser = StructuredParser::new(schema);

    let prompt = PromptTemplate::from_template(
        "namer",
        "You are a naming master. Invent 3 {gender} names with a {county} flavour, \
         in the style of: boy {boyName}, girl {girlName}.\n\n\
         Answer strictly in the format below, with no other text.\n\n\
         {format_instructions}",
    )
    .partial("format_instructions", parser.format_instructions());

    let chain = stream_into(
        compose(prompt, settings.chat_model().with_streaming(true)),
        parser,
    );

    println!("Streaming...\n");
    let result = chain
        .invoke(
            &ctx,
            vars([
                ("county", "China"),
                ("gender", "boy"),
                ("boyName", "Long'er"),
                ("girlName", "Feng'er"),
            ]),
        )
        .await?;

    if !result.is_parsed() {
        println!("\n\nReply did not match the schema; keeping raw text.");
    }
    println!("\n\n=== Result ===");
    println!("{}", serde_json::to_string_pretty(&result.to_value())?);

    Ok(())
}
