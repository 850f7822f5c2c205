//! Retrieval pipeline: embed the question, fetch the nearest files and ask
//! the completion model.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use code_analyzer_core::adapters::AdapterError;
use code_analyzer_core::models::RepositoryId;

use crate::analyze::{check_top_k, guarded, Adapters, PipelineSettings};
use crate::embedding::check_dims;
use crate::error::{PipelineError, Stage};
use crate::prompt;
use crate::retry::retry_adapter;

/// A generated answer and the keys of the files it was grounded on,
/// closest first.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub response: String,
    pub sources: Vec<String>,
}

pub async fn retrieve(
    adapters: &Adapters,
    settings: &PipelineSettings,
    repository: &RepositoryId,
    query: &str,
    top_k: Option<usize>,
    cancel: &CancellationToken,
) -> Result<Answer, PipelineError> {
    check_top_k(top_k)?;
    let limit = top_k.unwrap_or(settings.top_k);
    let repo = repository.as_str();

    let vector = retry_adapter(cancel, settings.embed_retry, "embed_query", || {
        adapters.embedder.embed(query)
    })
    .await
    .map_err(|e| PipelineError::from_retry(Stage::EmbedQuery, repo, e))?;
    if vector.is_empty() {
        return Err(PipelineError::stage(
            Stage::EmbedQuery,
            repo,
            AdapterError::permanent("embedding model returned an empty vector"),
        ));
    }
    let embedder = &adapters.embedder;
    check_dims(embedder.model_name(), &vector, embedder.dims())
        .map_err(|e| PipelineError::stage(Stage::EmbedQuery, repo, e))?;

    let related = guarded(
        cancel,
        Stage::QueryNearest,
        repo,
        adapters.vectors.query_nearest(repository, &vector, limit),
    )
    .await?;
    tracing::info!(repository = repo, related = related.len(), top_k = limit, "retrieved context");

    let conversation = prompt::compose(&related, query);
    let response = guarded(
        cancel,
        Stage::Complete,
        repo,
        adapters.completer.complete(&conversation),
    )
    .await?;

    Ok(Answer {
        response,
        sources: related.into_iter().map(|doc| doc.key).collect(),
    })
}
