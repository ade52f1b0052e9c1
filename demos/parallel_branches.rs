//! Fan one topic out to two prompt/model chains and merge the replies.

use llm_runnables::{
    compose,
    config::Settings,
    prompt::PromptTemplate,
    FnStage, ParallelGroup, SplitList, Stage, StageExt, StripReasoning,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env()?;
    let ctx = settings.exec_ctx()?;

    let joke = compose(
        PromptTemplate::new("joke")
            .system("You are a comedian. Reply with a single short joke.")
            .user("Tell me a joke about {input}."),
        settings.chat_model().with_name("joke-model"),
    )
    .pipe(StripReasoning::new());

    let facts = compose(
        PromptTemplate::new("facts")
            .system("Reply with a comma-separated list and nothing else.")
            .user("Give three short facts about {input}."),
        settings.chat_model().with_name("facts-model"),
    )
    .pipe(StripReasoning::new())
    .pipe(SplitList::comma())
    .pipe(FnStage::new("bullets", |items: Vec<String>| {
        Ok(items
            .iter()
            .map(|item| format!("- {}", item))
            .collect::<Vec<_>>()
            .join("\n"))
    }));

    let group = ParallelGroup::<String, String>::builder("joke-and-facts")
        .branch("joke", joke)
        .branch("facts", facts)
        .build()?;

    let merged = group.invoke(&ctx, "bears".to_string()).await?;
    for (branch, text) in &merged {
        println!("=== {} ===\n{}\n", branch, text);
    }

    Ok(())
}
