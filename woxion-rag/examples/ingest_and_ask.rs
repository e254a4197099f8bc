//! Ingest a few support articles and answer questions about them.
//!
//! Uses the offline backends unless `WOXION_RAG_EMBEDDING_PROVIDER` /
//! `WOXION_RAG_GENERATION_PROVIDER` select a remote one (with the matching
//! feature enabled).
//!
//! ```text
//! RUST_LOG=woxion_rag=debug cargo run --example ingest_and_ask -- "How long do refunds take?"
//! ```

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use woxion_rag::{ConversationTurn, Document, ProviderConfig, RagConfig, RagPipeline};

const ARTICLES: &[(&str, &str)] = &[
    (
        "refunds",
        "Refunds are issued to the original payment method. \
         A refund usually takes five business days to appear on your statement.\n\n\
         Orders cancelled before shipping are refunded in full.",
    ),
    (
        "shipping",
        "Parcels ship from our Hanoi warehouse every weekday. \
         Domestic parcels arrive within two days. \
         International parcels arrive within two weeks.",
    ),
    (
        "accounts",
        "You can reset your password from the sign-in page. \
         Two-factor authentication can be enabled under account settings.",
    ),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("woxion_rag=info")),
        )
        .init();

    let providers = ProviderConfig::from_env()?;
    let pipeline = Arc::new(
        RagPipeline::builder()
            .config(RagConfig::from_env()?)
            .embedding_provider(providers.embedding_provider()?)
            .generation_provider(providers.generation_provider()?)
            .build()?,
    );

    for (id, text) in ARTICLES {
        let generation = pipeline
            .ingest_document(Document::new(*id, *text).with_source_uri(format!("kb://{id}")))
            .await?;
        println!("ingested {id} as generation {generation}");
    }

    let question = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "How long does a refund take?".to_string());
    let history = [
        ConversationTurn::user("Hi, I returned an order last week."),
        ConversationTurn::assistant("Thanks for letting us know. How can I help?"),
    ];

    let answer = pipeline.answer_query(&question, None, &history).await?;
    println!();
    println!("Q: {question}");
    println!("A: {}", answer.text);
    println!("   confidence: {:.2} ({:?})", answer.confidence.score, answer.confidence.level);
    if answer.ungrounded {
        println!("   (no supporting documents found)");
    }
    for id in &answer.citations {
        if let Some(chunk) = pipeline.chunk_store().get(id).await {
            println!("   [{id}] {}", chunk.text);
        }
    }
    Ok(())
}
