//! A research notebook: saves paper metadata per topic on the local filesystem and lists what has
//! been collected so far.
//!
//! Finding papers is the caller's business; this server only stores and organizes what it is
//! given.  Where the notebook lives is itself a setting (`papers_dir`) that callers can change at
//! runtime.
use crate::settings::SettingsStore;
use anyhow::Context;
use mcpline_server::{
    ManifestError, McpServer, ParamType, ServerConfig, Tool, ToolCall, ToolError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::*;

pub const NAME: &str = "papers";

/// Setting that overrides where topics are stored
pub const PAPERS_DIR_SETTING: &str = "papers_dir";

const PAPERS_FILE: &str = "papers_info.json";

pub fn server(
    config: ServerConfig,
    settings: SettingsStore,
    default_dir: impl Into<PathBuf>,
) -> Result<McpServer, ManifestError> {
    let notebook = Arc::new(Notebook {
        settings,
        default_dir: default_dir.into(),
    });

    McpServer::builder(NAME, "Save, organize and summarize research papers by topic")
        .config(config)
        .tool(
            Tool::new("save_papers", "Save paper metadata under a research topic")
                .required(
                    "topic",
                    ParamType::String,
                    "Research topic, used as the folder name",
                )
                .required(
                    "papers",
                    ParamType::Array,
                    "Paper objects to save (title, authors, summary, ...)",
                ),
            with(&notebook, Notebook::save_papers),
        )
        .tool(
            Tool::new("list_topics", "List saved research topics with paper counts"),
            with(&notebook, Notebook::list_topics),
        )
        .tool(
            Tool::new(
                "research_prompt",
                "Build a prompt asking for a summary of the research on a topic",
            )
            .required("topic", ParamType::String, "Research topic")
            .optional(
                "num_papers",
                ParamType::Integer,
                "Number of papers that will follow the prompt (default 5)",
            ),
            research_prompt,
        )
        .tool(
            Tool::new(
                "delete_topic",
                "Delete a saved topic and all of its papers.  Asks for confirmation first.",
            )
            .required("topic", ParamType::String, "Research topic to delete")
            .optional(
                "confirmed",
                ParamType::Boolean,
                "Set to true once the user has agreed to the deletion",
            )
            .sensitive(),
            with(&notebook, Notebook::delete_topic),
        )
        .tool(
            Tool::new("get_setting", "Read one setting, or all of them")
                .optional("key", ParamType::String, "Setting to read; omit for all"),
            with(&notebook, Notebook::get_setting),
        )
        .tool(
            Tool::new("set_setting", "Change a setting and save it to disk")
                .required("key", ParamType::String, "Setting to change")
                .optional(
                    "value",
                    ParamType::String,
                    "New value; omit to remove the setting",
                ),
            with(&notebook, Notebook::set_setting),
        )
        .build()
}

/// Adapt a `Notebook` method into a tool handler that shares one notebook between every call
fn with<F, Fut>(
    notebook: &Arc<Notebook>,
    method: F,
) -> impl Fn(ToolCall) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<Notebook>, ToolCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    let notebook = notebook.clone();
    move |call| method(notebook.clone(), call)
}

/// Shared state behind the papers tools.  Read-only apart from the settings store, which does
/// its own locking.
#[derive(Debug)]
struct Notebook {
    settings: SettingsStore,
    default_dir: PathBuf,
}

#[derive(Debug, Serialize, PartialEq)]
struct TopicSummary {
    slug: String,
    topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    papers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Notebook {
    fn papers_dir(&self) -> Result<PathBuf, ToolError> {
        let configured = self
            .settings
            .get_string(PAPERS_DIR_SETTING)
            .map_err(anyhow::Error::from)?;

        Ok(configured
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_dir.clone()))
    }

    fn topic_dir(&self, topic: &str) -> Result<(String, PathBuf), ToolError> {
        let slug = topic_slug(topic)?;
        let dir = self.papers_dir()?.join(&slug);
        Ok((slug, dir))
    }

    #[instrument(skip_all, fields(id = %call.id()))]
    async fn save_papers(self: Arc<Self>, call: ToolCall) -> Result<Value, ToolError> {
        #[derive(Deserialize)]
        struct Args {
            topic: String,
            papers: Vec<Value>,
        }

        let Args { topic, papers } = call.args()?;
        let (slug, dir) = self.topic_dir(&topic)?;

        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating topic directory {}", dir.display()))?;

        let path = dir.join(PAPERS_FILE);
        let contents = serde_json::to_vec_pretty(&papers).context("serializing papers")?;
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        info!(%slug, count = papers.len(), path = %path.display(), "Saved papers");
        Ok(json!({
            "message": format!("Papers saved to: {}", path.display()),
            "path": path,
            "topic": slug,
            "count": papers.len(),
        }))
    }

    #[instrument(skip_all, fields(id = %call.id()))]
    async fn list_topics(self: Arc<Self>, call: ToolCall) -> Result<Value, ToolError> {
        let dir = self.papers_dir()?;
        let topics = read_topics(&dir).await?;
        debug!(count = topics.len(), dir = %dir.display(), "Listed topics");

        Ok(json!({
            "summary": render_topics(&topics),
            "topics": topics,
        }))
    }

    #[instrument(skip_all, fields(id = %call.id()))]
    async fn delete_topic(self: Arc<Self>, call: ToolCall) -> Result<Value, ToolError> {
        #[derive(Deserialize)]
        struct Args {
            topic: String,
            #[serde(default)]
            confirmed: bool,
        }

        let Args { topic, confirmed } = call.args()?;
        let (slug, dir) = self.topic_dir(&topic)?;

        // Only directories holding a papers file are topics; anything else under the papers
        // directory is left alone
        let papers_file = dir.join(PAPERS_FILE);
        let is_topic = tokio::fs::try_exists(&papers_file)
            .await
            .with_context(|| format!("checking for {}", papers_file.display()))?;
        if !is_topic {
            return Err(ToolError::failed(format!(
                "No saved papers for topic '{topic}'"
            )));
        }

        if !confirmed {
            debug!(%slug, "Asking for confirmation before deleting");
            return call.confirmation(format!(
                "Delete topic '{topic}' and all of its saved papers? This cannot be undone."
            ));
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("removing {}", dir.display()))?;

        info!(%slug, "Deleted topic");
        Ok(json!({ "deleted": slug }))
    }

    async fn get_setting(self: Arc<Self>, call: ToolCall) -> Result<Value, ToolError> {
        #[derive(Deserialize)]
        struct Args {
            key: Option<String>,
        }

        let Args { key } = call.args()?;
        match key {
            Some(key) => {
                let value = self.settings.get(&key).map_err(anyhow::Error::from)?;
                Ok(json!({ "key": key, "value": value }))
            }
            None => {
                let settings = self.settings.snapshot().map_err(anyhow::Error::from)?;
                Ok(json!({ "settings": settings }))
            }
        }
    }

    #[instrument(skip_all, fields(id = %call.id()))]
    async fn set_setting(self: Arc<Self>, call: ToolCall) -> Result<Value, ToolError> {
        #[derive(Deserialize)]
        struct Args {
            key: String,
            value: Option<String>,
        }

        let Args { key, value } = call.args()?;
        let value = value.map(Value::String).unwrap_or(Value::Null);

        let previous = self
            .settings
            .set(key.clone(), value.clone())
            .map_err(anyhow::Error::from)?;

        info!(%key, "Setting changed");
        Ok(json!({ "key": key, "value": value, "previous": previous }))
    }
}

async fn research_prompt(call: ToolCall) -> Result<Value, ToolError> {
    #[derive(Deserialize)]
    struct Args {
        topic: String,
        #[serde(default = "default_num_papers")]
        num_papers: u32,
    }

    fn default_num_papers() -> u32 {
        5
    }

    let Args { topic, num_papers } = call.args()?;
    let prompt = format!(
        "You are a research assistant analyzing academic papers on '{topic}'.\n\
         {num_papers} papers follow this message. For each paper:\n\
         1. Extract the key findings and methods\n\
         2. Identify themes shared across papers\n\
         3. Note any findings that contradict each other\n\
         4. Highlight important citations\n\
         \n\
         Then summarize the current state of research in this area, including open questions \
         and promising directions for future work."
    );

    Ok(json!({ "prompt": prompt }))
}

/// Folder name for a topic: lowercase, spaces become underscores.
///
/// Topics are caller supplied and end up in a filesystem path, so anything that could escape the
/// papers directory is refused.
fn topic_slug(topic: &str) -> Result<String, ToolError> {
    let trimmed = topic.trim();
    if trimmed.is_empty() {
        return Err(ToolError::invalid_arguments("`topic` must not be empty"));
    }
    if trimmed.contains(['/', '\\']) || trimmed.contains("..") || trimmed.starts_with('.') {
        return Err(ToolError::invalid_arguments(format!(
            "`topic` must not contain path separators or start with '.': {topic}"
        )));
    }

    Ok(trimmed.to_lowercase().replace(' ', "_"))
}

/// Human friendly form of a slug: `quantum_ml` becomes `Quantum Ml`
fn topic_title(slug: &str) -> String {
    slug.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

async fn read_topics(dir: &Path) -> Result<Vec<TopicSummary>, ToolError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("reading {}", dir.display()))
                .into())
        }
    };

    let mut topics = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", dir.display()))?
    {
        let papers_file = entry.path().join(PAPERS_FILE);
        let contents = match tokio::fs::read(&papers_file).await {
            Ok(contents) => contents,
            // Directories without a papers file aren't topics
            Err(_) => continue,
        };

        let slug = entry.file_name().to_string_lossy().into_owned();
        let (papers, error) = match serde_json::from_slice::<Vec<Value>>(&contents) {
            Ok(papers) => (Some(papers.len()), None),
            Err(e) => {
                warn!(error = %e, path = %papers_file.display(), "Corrupted papers file");
                (None, Some("Corrupted data".to_string()))
            }
        };

        topics.push(TopicSummary {
            topic: topic_title(&slug),
            slug,
            papers,
            error,
        });
    }

    topics.sort_by(|a, b| a.slug.cmp(&b.slug));
    Ok(topics)
}

fn render_topics(topics: &[TopicSummary]) -> String {
    if topics.is_empty() {
        return "No saved topics found.".to_string();
    }

    let lines: Vec<String> = topics
        .iter()
        .map(|topic| match (topic.papers, &topic.error) {
            (Some(count), _) => format!("- {}: {count} papers", topic.topic),
            (None, Some(error)) => format!("- {}: [{error}]", topic.topic),
            (None, None) => format!("- {}", topic.topic),
        })
        .collect();

    format!("# Saved Research Topics\n\n{}", lines.join("\n"))
}
