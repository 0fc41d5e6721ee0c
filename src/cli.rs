use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_openai::Client;
use async_openai::config::{Config, OpenAIConfig};
use clap::builder::styling::{AnsiColor, Color, Style, Styles};
use clap::{Args, ColorChoice, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::{Generator, Shell, generate};
use clap_complete_nushell::Nushell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use schemars::schema_for;
use tracing::info;
use tracing_indicatif::indicatif_println;

use crate::AppResult;
use crate::artifact::{ArtifactPaths, EmbeddingArtifact, LabelArtifact};
use crate::cluster::{
    DEFAULT_K, DEFAULT_MAX_ITER, DEFAULT_N_INIT, DEFAULT_SEED, DEFAULT_TOLERANCE, KMeansClusterer,
};
use crate::embed::{DEFAULT_DIMENSIONS, EmbedOptions, EmbedderKind};
use crate::stages;
use crate::themes::{AnnotatedFeedback, ThemeMap, parse_assignment};

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .error(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))))
    .literal(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .valid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
    .context(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta))))
    .context_value(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
    );

/// Long-form CLI description shown in `--help`.
const LONG_ABOUT: &str = "Feedback Themes - Group customer feedback into themes

The analysis runs as four stages, each reading and writing JSON files in the
working directory so that any stage can be re-run on its own:

1. embed     sample_feedback.json       -> feedback_embeddings.json
2. cluster   feedback_embeddings.json   -> cluster_labels.json
3. annotate  feedback + labels + themes -> clustered_feedback_analyzed.json
4. report    clustered_feedback_analyzed.json -> stdout

Between clustering and annotation, `review` prints sample feedback per cluster so
you can decide what each cluster is about and write a theme map.";

/// Feedback Themes - Group customer feedback into themes.
#[derive(Parser, Debug, Clone)]
#[command(author, version, propagate_version = true, about, long_about = Some(LONG_ABOUT), styles = STYLES)]
pub struct Cli {
    /// Color choice for the output
    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Subcommand to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Top-level commands supported by the CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Vectorize the feedback source
    Embed {
        #[command(flatten)]
        artifacts: ArtifactArgs,
        #[command(flatten)]
        embedder: EmbedderArgs,
    },

    /// Group the embeddings into clusters
    Cluster {
        #[command(flatten)]
        artifacts: ArtifactArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Print sample feedback for each cluster
    ///
    /// Use the samples to decide on a theme for every cluster, then pass the
    /// themes to `annotate` with `--theme-map` or `--theme`.
    Review {
        #[command(flatten)]
        artifacts: ArtifactArgs,
        #[command(flatten)]
        review: ReviewArgs,
    },

    /// Assign a theme to every feedback item
    Annotate {
        #[command(flatten)]
        artifacts: ArtifactArgs,
        #[command(flatten)]
        themes: ThemeArgs,
    },

    /// Print the feedback grouped by theme
    Report {
        #[command(flatten)]
        artifacts: ArtifactArgs,
    },

    /// Run every stage in order
    ///
    /// Clusters without a theme are annotated with a placeholder theme.
    Run {
        #[command(flatten)]
        artifacts: ArtifactArgs,
        #[command(flatten)]
        embedder: EmbedderArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        review: ReviewArgs,
        #[command(flatten)]
        themes: ThemeArgs,
    },

    /// Print the JSON Schema of an artifact
    Schema {
        /// The artifact to describe
        #[arg(value_enum)]
        artifact: ArtifactKind,
    },

    /// Generate shell completion for a given shell
    Completion {
        /// Output file to write the completion script to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The shell to generate the completion for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

/// Supported completion targets for shell auto-completion.
#[derive(ValueEnum, Clone, Debug)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
    Nushell,
}

impl Display for CompletionShell {
    /// Render the canonical shell name string.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionShell::Bash => "bash",
            CompletionShell::Zsh => "zsh",
            CompletionShell::Fish => "fish",
            CompletionShell::PowerShell => "powershell",
            CompletionShell::Elvish => "elvish",
            CompletionShell::Nushell => "nushell",
        };
        write!(f, "{}", s)
    }
}

impl Generator for &CompletionShell {
    fn generate(&self, cmd: &clap::builder::Command, buf: &mut dyn Write) {
        match self {
            CompletionShell::Bash => Shell::Bash.generate(cmd, buf),
            CompletionShell::Zsh => Shell::Zsh.generate(cmd, buf),
            CompletionShell::Fish => Shell::Fish.generate(cmd, buf),
            CompletionShell::PowerShell => Shell::PowerShell.generate(cmd, buf),
            CompletionShell::Elvish => Shell::Elvish.generate(cmd, buf),
            CompletionShell::Nushell => Nushell.generate(cmd, buf),
        }
    }

    fn file_name(&self, name: &str) -> String {
        match self {
            CompletionShell::Bash => Shell::Bash.file_name(name),
            CompletionShell::Zsh => Shell::Zsh.file_name(name),
            CompletionShell::Fish => Shell::Fish.file_name(name),
            CompletionShell::PowerShell => Shell::PowerShell.file_name(name),
            CompletionShell::Elvish => Shell::Elvish.file_name(name),
            CompletionShell::Nushell => Nushell.file_name(name),
        }
    }
}

/// Artifacts with a JSON Schema.
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ArtifactKind {
    /// The feedback source: a list of strings
    Feedback,
    /// The embedding matrix
    Embeddings,
    /// The cluster label vector
    Labels,
    /// The annotated output
    Annotated,
    /// The reviewer's cluster id to theme mapping
    ThemeMap,
}

impl ArtifactKind {
    pub fn schema(&self) -> AppResult<String> {
        let schema = match self {
            Self::Feedback => schema_for!(Vec<String>),
            Self::Embeddings => schema_for!(EmbeddingArtifact),
            Self::Labels => schema_for!(LabelArtifact),
            Self::Annotated => schema_for!(Vec<AnnotatedFeedback>),
            Self::ThemeMap => schema_for!(ThemeMap),
        };
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

/// Where the artifacts live.
#[derive(Args, Debug, Clone)]
pub struct ArtifactArgs {
    /// Directory holding the artifacts
    #[arg(short = 'C', long, default_value = ".")]
    pub workdir: PathBuf,

    /// Feedback source, a JSON list of strings [default: <WORKDIR>/sample_feedback.json]
    #[arg(long)]
    pub feedback: Option<PathBuf>,

    /// Embedding artifact [default: <WORKDIR>/feedback_embeddings.json]
    #[arg(long)]
    pub embeddings: Option<PathBuf>,

    /// Label artifact [default: <WORKDIR>/cluster_labels.json]
    #[arg(long)]
    pub labels: Option<PathBuf>,

    /// Annotated output [default: <WORKDIR>/clustered_feedback_analyzed.json]
    #[arg(long)]
    pub annotated: Option<PathBuf>,
}

impl ArtifactArgs {
    pub fn paths(&self) -> ArtifactPaths {
        let mut paths = ArtifactPaths::in_dir(&self.workdir);
        let overrides = [
            (&mut paths.feedback, &self.feedback),
            (&mut paths.embeddings, &self.embeddings),
            (&mut paths.labels, &self.labels),
            (&mut paths.annotated, &self.annotated),
        ];
        for (path, custom) in overrides {
            if let Some(custom) = custom {
                *path = custom.clone();
            }
        }
        paths
    }
}

/// Options for the embedding backend.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// Embedding backend
    #[arg(long, value_enum, default_value_t = EmbedderKind::Hashing)]
    pub embedder: EmbedderKind,

    /// Model name for the `local` or `openai` backend
    #[arg(long)]
    pub model: Option<String>,

    /// Vector size for the `hashing` backend
    #[arg(long, default_value_t = DEFAULT_DIMENSIONS)]
    pub dimensions: usize,

    /// Texts per request for the `openai` backend
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    /// Requests in flight for the `openai` backend
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Whether to use secure connection (HTTPS) to the embeddings server
    /// Defaults to false for local servers (i.e. `localhost` and private subnets)
    /// Defaults to true for public IP addresses and hostnames
    /// Note: This is not a flag. You must provide a value (true or false) if you use this option.
    #[arg(long)]
    pub secure: Option<bool>,

    /// Host for the embeddings server
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port for the embeddings server
    #[arg(long, default_value_t = 1234)]
    pub port: u16,

    /// OpenAI API version for the embeddings server
    ///
    /// Defaults to "v1" (the standard OpenAI API version)
    #[arg(long, default_value = "v1")]
    pub api_version: String,
}

impl EmbedderArgs {
    fn is_local_host(&self) -> bool {
        self.host == "localhost"
            || self.host.ends_with(".local")
            || self.host.ends_with(".internal")
            || self.host.ends_with(".lan")
            || self.host.ends_with(".corp")
            || self.host.ends_with(".home.arpa")
            || self.host.ends_with(".private")
            || self.host.ends_with(".test")
            || self
                .host
                .parse::<std::net::Ipv4Addr>()
                .is_ok_and(|ip| ip.is_loopback() || ip.is_private() || ip.is_link_local())
            || self.host.parse::<std::net::Ipv6Addr>().is_ok_and(|ip| {
                ip.is_loopback() || ip.is_unique_local() || ip.is_unicast_link_local()
            })
    }

    pub fn base_url(&self) -> String {
        let scheme = match self.secure {
            Some(true) => "https",
            Some(false) => "http",
            None if self.is_local_host() => "http",
            None => "https",
        };
        format!("{scheme}://{}:{}/{}", self.host, self.port, self.api_version)
    }

    pub fn get_client(&self) -> Client<Box<dyn Config>> {
        let config =
            Box::new(OpenAIConfig::default().with_api_base(self.base_url())) as Box<dyn Config>;
        Client::with_config(config)
    }

    pub fn options(&self) -> EmbedOptions<Box<dyn Config>> {
        EmbedOptions {
            kind: self.embedder,
            model: self.model.clone(),
            dimensions: self.dimensions,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            client: self.get_client(),
        }
    }
}

/// Options for K-Means.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Number of clusters
    #[arg(short = 'k', long = "clusters", default_value_t = DEFAULT_K)]
    pub k: usize,

    /// Seed for center initialisation; the same seed gives the same clusters
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Restarts with different centers; the lowest inertia wins
    #[arg(long, default_value_t = DEFAULT_N_INIT)]
    pub n_init: usize,

    /// Iteration cap per restart
    #[arg(long, default_value_t = DEFAULT_MAX_ITER)]
    pub max_iterations: usize,

    /// Center shift below which a restart counts as converged
    #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
    pub tolerance: f64,
}

impl ClusterArgs {
    pub fn clusterer(&self) -> KMeansClusterer {
        KMeansClusterer {
            n_init: self.n_init,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }
}

/// Options for reviewing clusters.
#[derive(Args, Debug, Clone)]
pub struct ReviewArgs {
    /// Sample texts printed per cluster
    #[arg(long, default_value_t = 4)]
    pub samples: usize,

    /// Write a theme map template with a placeholder theme per cluster
    #[arg(long)]
    pub template: Option<PathBuf>,
}

/// Where the cluster themes come from.
#[derive(Args, Debug, Clone)]
pub struct ThemeArgs {
    /// JSON object mapping cluster ids to themes, e.g. `{"0": "Usability"}`
    #[arg(long)]
    pub theme_map: Option<PathBuf>,

    /// Theme for one cluster as ID=NAME; repeatable, overrides --theme-map
    #[arg(long = "theme", value_name = "ID=NAME", value_parser = parse_assignment)]
    pub themes: Vec<(usize, String)>,
}

impl ThemeArgs {
    /// Merge the theme map file with the command-line assignments.
    pub async fn theme_map(&self) -> AppResult<ThemeMap> {
        let mut map = match &self.theme_map {
            Some(path) => ThemeMap::load(path).await?,
            None => ThemeMap::new(),
        };
        for (id, name) in &self.themes {
            map.insert(*id, name.as_str())?;
        }
        Ok(map)
    }
}

fn write_completion(shell: &CompletionShell, output: Option<&Path>) -> AppResult<()> {
    let mut cmd = Cli::command();
    if let Some(output_path) = output {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(output_path)?;
        generate(shell, &mut cmd, "feedback-themes", &mut file);
        info!(
            "Generated completion script for {} at {}",
            shell,
            output_path.display()
        );
    } else {
        generate(shell, &mut cmd, "feedback-themes", &mut std::io::stdout());
    }
    Ok(())
}

impl Cmd {
    /// Execute the chosen top-level command.
    #[tracing::instrument(name = "Running command", level = "info", skip(self))]
    pub async fn run(&self) -> AppResult<()> {
        match self {
            Cmd::Embed {
                artifacts,
                embedder,
            } => {
                stages::embed_stage(&artifacts.paths(), embedder.options()).await?;
            }
            Cmd::Cluster { artifacts, cluster } => {
                stages::cluster_stage(
                    &artifacts.paths(),
                    &cluster.clusterer(),
                    cluster.k,
                    cluster.seed,
                )
                .await?;
            }
            Cmd::Review { artifacts, review } => {
                let listing = stages::review_stage(
                    &artifacts.paths(),
                    review.samples,
                    review.template.as_deref(),
                )
                .await?;
                indicatif_println!("{listing}");
            }
            Cmd::Annotate { artifacts, themes } => {
                let map = themes.theme_map().await?;
                stages::annotate_stage(&artifacts.paths(), &map).await?;
            }
            Cmd::Report { artifacts } => {
                let report = stages::report_stage(&artifacts.paths()).await?;
                indicatif_println!("{report}");
            }
            Cmd::Run {
                artifacts,
                embedder,
                cluster,
                review,
                themes,
            } => {
                // Fail on a bad theme map before spending time on embeddings.
                let map = themes.theme_map().await?;
                let paths = artifacts.paths();
                stages::embed_stage(&paths, embedder.options()).await?;
                stages::cluster_stage(&paths, &cluster.clusterer(), cluster.k, cluster.seed)
                    .await?;
                let listing =
                    stages::review_stage(&paths, review.samples, review.template.as_deref())
                        .await?;
                indicatif_println!("{listing}");
                stages::annotate_stage(&paths, &map).await?;
                let report = stages::report_stage(&paths).await?;
                indicatif_println!("{report}");
            }
            Cmd::Schema { artifact } => {
                let schema = artifact.schema()?;
                indicatif_println!("{schema}");
            }
            Cmd::Completion { shell, output } => {
                write_completion(shell, output.as_deref())?;
            }
        }
        Ok(())
    }
}
