//! Thin request layer over the databrowser endpoints.

use futures::StreamExt;
use serde_json::Value;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Could not connect to {0}")]
    Connection(String),
    #[error("search failed: {0}")]
    Search(String),
}

/// Parse positional `key=value` arguments into query pairs; repeated keys
/// express a disjunction.
pub fn parse_cli_args(cli_args: &[String]) -> Vec<(String, String)> {
    cli_args
        .iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Stream the matching uniq keys line by line to the given writer.
pub async fn data_search(
    config: &Config,
    params: &[(String, String)],
    mut sink: impl std::io::Write,
) -> Result<(), ClientError> {
    let url = config.search_url();
    let response = reqwest::Client::new()
        .get(&url)
        .query(params)
        .send()
        .await
        .map_err(|_| ClientError::Connection(url.clone()))?
        .error_for_status()
        .map_err(|e| ClientError::Search(e.to_string()))?;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ClientError::Search(e.to_string()))?;
        sink.write_all(&chunk)
            .map_err(|e| ClientError::Search(e.to_string()))?;
    }
    Ok(())
}

/// The facet counts of a metadata search.
pub async fn metadata_search(
    config: &Config,
    params: &[(String, String)],
) -> Result<Value, ClientError> {
    let url = config.metadata_url();
    reqwest::Client::new()
        .get(&url)
        .query(params)
        .send()
        .await
        .map_err(|_| ClientError::Connection(url.clone()))?
        .error_for_status()
        .map_err(|e| ClientError::Search(e.to_string()))?
        .json()
        .await
        .map_err(|e| ClientError::Search(e.to_string()))
}

/// Total number of matching records; with `detail` the per-facet counts.
pub async fn count(
    config: &Config,
    params: &[(String, String)],
    detail: bool,
) -> Result<Value, ClientError> {
    let result = metadata_search(config, params).await?;
    if detail {
        Ok(result.get("facets").cloned().unwrap_or(Value::Null))
    } else {
        Ok(result.get("total_count").cloned().unwrap_or(Value::from(0)))
    }
}

/// All flavours and their search attributes.
pub async fn overview(config: &Config) -> Result<Value, ClientError> {
    let url = config.overview_url();
    reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
        .map_err(|_| ClientError::Connection(url.clone()))?
        .json()
        .await
        .map_err(|e| ClientError::Search(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_args() {
        let args: Vec<String> = ["project=cmip5", "variable=tas", "variable=pr", "broken"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = parse_cli_args(&args);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], ("project".to_string(), "cmip5".to_string()));
        assert_eq!(parsed[2], ("variable".to_string(), "pr".to_string()));
    }
}
