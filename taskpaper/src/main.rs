use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use taskpaper::format::{self, HtmlOptions, TextWriter};
use taskpaper::projection::{self, ItemView};
use taskpaper::storage::{DocumentParser, DocumentWriter};
use taskpaper::transform::{EntityEncoding, OutputKind, TransformChain};
use taskpaper::{Document, LineBreak, Settings, TextDocumentParser};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taskpaper", about = "Outline tooling for TaskPaper-style text files", version)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Spaces that count as one indentation level (0 = tabs only).
    #[arg(long, global = true, default_value_t = 4)]
    tab_size: usize,
    /// Line terminator used when writing text back out.
    #[arg(long, global = true, value_enum, default_value_t = LineBreakArg::Unix)]
    line_break: LineBreakArg,
    /// Turn `# Heading` lines into projects while parsing.
    #[arg(long, global = true)]
    convert_atx_headings: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LineBreakArg {
    Unix,
    Mac,
    Windows,
}

impl From<LineBreakArg> for LineBreak {
    fn from(arg: LineBreakArg) -> Self {
        match arg {
            LineBreakArg::Unix => LineBreak::Unix,
            LineBreakArg::Mac => LineBreak::Mac,
            LineBreakArg::Windows => LineBreak::Windows,
        }
    }
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            tab_size: self.tab_size,
            line_break: self.line_break.into(),
            convert_atx_headings: self.convert_atx_headings,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse outline files and print their item tree.
    Parse(ParseArgs),

    /// Rewrite outline files with canonical tab indentation.
    Format(FormatArgs),

    /// Print item types (and titles) as an indented outline.
    Structure(StructureArgs),

    /// Print the tags of every item, or the distinct tags in use.
    Tags(TagsArgs),

    /// Print every link found in the outline.
    Links(LinksArgs),

    /// Render the outline as an HTML list.
    Html(HtmlArgs),

    /// Sum a numeric tag over leaf items and write subtotals onto branches.
    Total(TotalArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Outline files or directories containing `.taskpaper` files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct StructureArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Print only the item types.
    #[arg(long)]
    no_titles: bool,
}

#[derive(Debug, Args)]
struct TagsArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// List each distinct tag once instead of per item.
    #[arg(long)]
    all: bool,
    /// Leave tag values out.
    #[arg(long)]
    no_values: bool,
}

#[derive(Debug, Args)]
struct LinksArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Print links as written, without adding `http://` or `mailto:`.
    #[arg(long)]
    raw: bool,
}

#[derive(Debug, Args)]
struct HtmlArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Render the project navigation sidebar instead of the full list.
    #[arg(long)]
    sidebar: bool,
    /// Enable markdown, emoticon and tag icon rendering.
    #[arg(long)]
    plugins: bool,
    /// Heading used by the sidebar.
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Args)]
struct TotalArgs {
    /// Tag whose values are summed, e.g. `estimate`.
    tag: String,
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Write subtotals onto every branch, not only those already tagged.
    #[arg(long)]
    always_update: bool,
    /// Save the updated outline back to disk.
    #[arg(long)]
    write: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = run(cli)?;
    print!("{output}");
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<String> {
    let settings = cli.settings();
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &settings),
        Commands::Format(args) => handle_format(args, &settings),
        Commands::Structure(args) => handle_structure(args, &settings),
        Commands::Tags(args) => handle_tags(args, &settings),
        Commands::Links(args) => handle_links(args, &settings),
        Commands::Html(args) => handle_html(args, &settings),
        Commands::Total(args) => handle_total(args, &settings),
    }
}

fn load_documents(inputs: &[PathBuf], settings: &Settings) -> Result<Vec<(PathBuf, Document)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no .taskpaper files found in the provided inputs");
    }
    let parser = TextDocumentParser::new(settings.clone());
    expanded
        .into_iter()
        .map(|path| {
            debug!(path = %path.display(), "parsing");
            let doc = parser.parse_file(&path).with_context(|| format!("parsing {:?}", path))?;
            Ok((path, doc))
        })
        .collect()
}

/// Concatenate per-file output, with a `== path ==` header when there is
/// more than one file.
fn join_outputs(outputs: Vec<(PathBuf, String)>) -> String {
    let many = outputs.len() > 1;
    let mut out = String::new();
    for (idx, (path, text)) in outputs.into_iter().enumerate() {
        if many {
            if idx > 0 {
                out.push('\n');
            }
            out.push_str(&format!("== {} ==\n", path.display()));
        }
        out.push_str(&text);
        if !text.is_empty() && !text.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn handle_parse(args: ParseArgs, settings: &Settings) -> Result<String> {
    let ParseArgs { inputs, json } = args;
    let docs = load_documents(&inputs, settings)?;
    let chain = TransformChain::new();

    if json {
        #[derive(Serialize)]
        struct JsonOutput {
            path: String,
            items: Vec<ItemView>,
        }

        let payload: Vec<JsonOutput> = docs
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                items: projection::project(doc, &chain, OutputKind::Json),
            })
            .collect();
        let mut rendered = serde_json::to_string_pretty(&payload)?;
        rendered.push('\n');
        return Ok(rendered);
    }

    Ok(join_outputs(
        docs.iter()
            .map(|(path, doc)| (path.clone(), format!("{:#?}", projection::project(doc, &chain, OutputKind::Text))))
            .collect(),
    ))
}

fn handle_format(args: FormatArgs, settings: &Settings) -> Result<String> {
    let FormatArgs { inputs, in_place } = args;
    let docs = load_documents(&inputs, settings)?;

    if in_place {
        let writer = TextWriter::default();
        for (path, doc) in &docs {
            writer.write_file(doc, path)?;
            info!(path = %path.display(), "formatted");
        }
        return Ok(String::new());
    }
    Ok(join_outputs(docs.into_iter().map(|(path, doc)| (path, format::format_document(&doc))).collect()))
}

fn handle_structure(args: StructureArgs, settings: &Settings) -> Result<String> {
    let docs = load_documents(&args.inputs, settings)?;
    Ok(join_outputs(
        docs.into_iter()
            .map(|(path, doc)| (path, format::to_structure(&doc, !args.no_titles)))
            .collect(),
    ))
}

fn handle_tags(args: TagsArgs, settings: &Settings) -> Result<String> {
    let TagsArgs { inputs, all, no_values } = args;
    let docs = load_documents(&inputs, settings)?;
    if all {
        let mut tags = BTreeSet::new();
        for (_, doc) in &docs {
            tags.extend(doc.all_tags(!no_values, true));
        }
        return Ok(tags.into_iter().map(|t| t + "\n").collect());
    }
    Ok(join_outputs(
        docs.into_iter()
            .map(|(path, doc)| (path, format::to_tags(&doc, !no_values)))
            .collect(),
    ))
}

fn handle_links(args: LinksArgs, settings: &Settings) -> Result<String> {
    let docs = load_documents(&args.inputs, settings)?;
    Ok(docs
        .into_iter()
        .map(|(_, doc)| format::to_links(&doc, !args.raw))
        .collect())
}

fn handle_html(args: HtmlArgs, settings: &Settings) -> Result<String> {
    let HtmlArgs { inputs, sidebar, plugins, title } = args;
    let docs = load_documents(&inputs, settings)?;
    let chain = if plugins {
        TransformChain::html_defaults()
    } else {
        let mut chain = TransformChain::new();
        chain.push(Box::new(EntityEncoding));
        chain
    };

    Ok(join_outputs(
        docs.into_iter()
            .map(|(path, doc)| {
                let html = if sidebar {
                    format::to_sidebar(&doc, &chain, title.as_deref())
                } else {
                    format::to_html(&doc, &chain, &HtmlOptions::default())
                };
                (path, html)
            })
            .collect(),
    ))
}

fn handle_total(args: TotalArgs, settings: &Settings) -> Result<String> {
    let TotalArgs { tag, inputs, always_update, write } = args;
    let docs = load_documents(&inputs, settings)?;
    let writer = TextWriter::default();

    let mut out = String::new();
    for (path, mut doc) in docs {
        let root = doc.root();
        let total = doc.total_tag_values(root, &tag, always_update);
        info!(path = %path.display(), tag = %tag, total, "totalled");
        out.push_str(&format!("{}: {total}\n", path.display()));
        if write {
            writer.write_file(&doc, &path)?;
        }
    }
    Ok(out)
}

fn is_outline_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "taskpaper").unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for path in paths {
        let canonical = fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical).with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = %canonical.display(), "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if seen.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_outline_file(&canonical) {
                anyhow::bail!("{:?} is not a .taskpaper file", canonical);
            }
            if seen.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_outline_file(&canonical) {
        debug!(file = %canonical.display(), "found outline");
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("taskpaper").chain(args.iter().copied())).expect("cli args");
        run(cli)
    }

    #[test]
    fn expand_inputs_walks_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("nested");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(tmp.path().join("a.taskpaper"), "A:\n").expect("write a");
        fs::write(nested.join("b.taskpaper"), "B:\n").expect("write b");
        fs::write(tmp.path().join("notes.txt"), "skip me").expect("write txt");

        let found = expand_inputs(&[tmp.path().to_path_buf(), tmp.path().join("a.taskpaper")]).expect("expand");
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.taskpaper", "b.taskpaper"]);
    }

    #[test]
    fn expand_inputs_rejects_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let txt = tmp.path().join("notes.txt");
        fs::write(&txt, "x").expect("write");
        assert!(expand_inputs(&[txt]).is_err());
    }

    #[test]
    fn format_normalises_indentation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("list.taskpaper");
        fs::write(&path, "A:\n  - b\n    c\n").expect("write");
        let out = run_args(&["format", "--tab-size", "2", path.to_str().expect("utf8 path")]).expect("format");
        assert_eq!(out, "A:\n\t- b\n\t\tc\n");
    }

    #[test]
    fn total_writes_subtotals_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("budget.taskpaper");
        fs::write(&path, "Budget: @cost\n\t- rent @cost(2)\n\t- food @cost(3)\n").expect("write");

        let out = run_args(&["total", "cost", "--write", path.to_str().expect("utf8 path")]).expect("total");
        assert!(out.trim_end().ends_with(": 5"));
        assert_eq!(
            fs::read_to_string(&path).expect("read back"),
            "Budget: @cost(5)\n\t- rent @cost(2)\n\t- food @cost(3)\n"
        );
    }

    #[test]
    fn tags_all_lists_distinct_tags() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("t.taskpaper");
        fs::write(&path, "- a @due(mon) @flag\n- b @flag\n").expect("write");
        let out = run_args(&["tags", "--all", path.to_str().expect("utf8 path")]).expect("tags");
        assert_eq!(out, "@due(mon)\n@flag\n");
    }

    #[test]
    fn html_escapes_text_without_plugins() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("h.taskpaper");
        fs::write(&path, "- a <b> *c*\n").expect("write");
        let out = run_args(&["html", path.to_str().expect("utf8 path")]).expect("html");
        assert!(out.contains("a &lt;b&gt; *c*"));

        let out = run_args(&["html", "--plugins", path.to_str().expect("utf8 path")]).expect("html");
        assert!(out.contains("<em>c</em>"));
    }
}
