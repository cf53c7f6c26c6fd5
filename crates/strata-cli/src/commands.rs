use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::{json, Value};
use strata_sdk::{
    run_once, ChangeSummary, Digest, Engine, EngineConfig, EntryMode, LayerPath, OpContext,
    ResolvedEntry,
};
use tracing::debug;

use crate::cli::*;

/// Configuration file looked up inside the root.
pub const CONFIG_FILE: &str = "strata.toml";

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    if let Command::Init(args) = &cli.command {
        return cmd_init(&cli.root, args, format);
    }

    let config = load_config(&cli.root, cli.config.as_deref())?;
    if let Command::Config(_) = &cli.command {
        return cmd_config(&config, format);
    }
    let engine = open_engine(config)?;

    match cli.command {
        Command::Import(args) => cmd_import(&engine, args, format),
        Command::Apply(args) => cmd_apply(&engine, args, format),
        Command::Ls(args) => cmd_ls(&engine, args, format),
        Command::Cat(args) => cmd_cat(&engine, args),
        Command::Stat(args) => cmd_stat(&engine, args, format),
        Command::Chain(args) => cmd_chain(&engine, args, format),
        Command::Export(args) => cmd_export(&engine, args, format),
        Command::Tag(args) => cmd_tag(&engine, args, format),
        Command::Layers(args) => cmd_layers(&engine, args, format),
        Command::Gc(args) => cmd_gc(&engine, args, format).await,
        Command::Stats(_) => cmd_stats(&engine, format),
        Command::Init(_) | Command::Config(_) => Ok(()),
    }
}

// ---- Setup ----

/// The explicit `--config` file, else `<root>/strata.toml` when present,
/// else defaults. A config without a root is rooted at `root`.
fn load_config(root: &Path, explicit: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let file = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.join(CONFIG_FILE));
    let mut config = if file.exists() {
        EngineConfig::load(&file).with_context(|| format!("loading {}", file.display()))?
    } else if explicit.is_some() {
        bail!("config file {} not found", file.display());
    } else {
        EngineConfig::default()
    };
    if config.root.is_none() {
        config.root = Some(root.to_path_buf());
    }
    Ok(config)
}

fn open_engine(config: EngineConfig) -> anyhow::Result<Engine> {
    let root = config.root.clone().unwrap_or_else(|| PathBuf::from("."));
    if !root.is_dir() {
        bail!(
            "no Strata root at {} (run `strata init` first)",
            root.display()
        );
    }
    debug!(root = %root.display(), "opening engine");
    Engine::open(config).with_context(|| format!("opening {}", root.display()))
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn entry_json(entry: &ResolvedEntry) -> Value {
    json!({
        "path": entry.path.as_str(),
        "mode": entry.meta.mode.to_string(),
        "size": entry.meta.size,
        "mtime": entry.meta.mtime,
        "content": (!entry.is_dir()).then(|| entry.meta.content.to_hex()),
        "source": entry.source.to_string(),
    })
}

fn summary_json(summary: &ChangeSummary) -> Value {
    fn paths(paths: &[LayerPath]) -> Vec<&str> {
        paths.iter().map(LayerPath::as_str).collect()
    }
    json!({
        "added": paths(&summary.added),
        "modified": paths(&summary.modified),
        "deleted": paths(&summary.deleted),
        "bytes": summary.bytes,
    })
}

fn kind(mode: EntryMode) -> &'static str {
    match mode {
        EntryMode::Regular => "file",
        EntryMode::Executable => "executable",
        EntryMode::Symlink => "symlink",
        EntryMode::Directory => "directory",
    }
}

/// Split `PATH=FILE`.
fn parse_edit(spec: &str) -> anyhow::Result<(&str, &Path)> {
    match spec.split_once('=') {
        Some((path, file)) if !path.is_empty() && !file.is_empty() => Ok((path, Path::new(file))),
        _ => bail!("expected PATH=FILE, got {spec:?}"),
    }
}

// ---- Commands ----

fn cmd_init(root: &Path, args: &InitArgs, format: OutputFormat) -> anyhow::Result<()> {
    std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    let file = root.join(CONFIG_FILE);
    let wrote_config = args.force || !file.exists();
    if wrote_config {
        let text = EngineConfig::default().to_toml_string()?;
        std::fs::write(&file, text).with_context(|| format!("writing {}", file.display()))?;
    }
    let engine = open_engine(load_config(root, None)?)?;
    let stats = engine.stats();

    if format == OutputFormat::Json {
        return print_json(&json!({
            "root": root.display().to_string(),
            "config": file.display().to_string(),
            "layers": stats.layers,
            "refs": stats.refs,
        }));
    }
    println!(
        "{} Initialized Strata root in {}",
        "✓".green().bold(),
        root.display().to_string().bold()
    );
    if wrote_config {
        println!("  Config: {}", file.display().to_string().cyan());
    }
    if stats.layers > 0 {
        println!("  Existing layers: {}", stats.layers.to_string().bold());
    }
    Ok(())
}

fn cmd_config(config: &EngineConfig, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(&serde_json::to_value(config)?);
    }
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn cmd_import(engine: &Engine, args: ImportArgs, format: OutputFormat) -> anyhow::Result<()> {
    let parent = args
        .parent
        .as_deref()
        .map(|t| engine.resolve_target(t))
        .transpose()?;
    let (digest, stats) = engine.import_dir(parent, &args.dir)?;
    if let Some(tag) = &args.tag {
        engine.tag(tag, &digest)?;
    }

    if format == OutputFormat::Json {
        return print_json(&json!({
            "layer": digest.to_hex(),
            "parent": parent.map(|p| p.to_hex()),
            "tag": args.tag,
            "stats": stats,
        }));
    }
    println!(
        "{} Imported {} as layer {}",
        "✓".green().bold(),
        args.dir.display().to_string().bold(),
        digest.short_hex().yellow()
    );
    println!(
        "  {} files, {} dirs, {} symlinks, {} whiteouts, {} bytes",
        stats.files, stats.dirs, stats.symlinks, stats.whiteouts, stats.bytes
    );
    if let Some(tag) = &args.tag {
        println!("  Tagged: {}", tag.cyan());
    }
    Ok(())
}

fn cmd_apply(engine: &Engine, args: ApplyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let base = args
        .base
        .as_deref()
        .map(|t| engine.resolve_target(t))
        .transpose()?;
    let ctx = match args.timeout_ms {
        Some(ms) => OpContext::with_timeout(Duration::from_millis(ms)),
        None => OpContext::none(),
    };

    let layer = engine.create_writable(base)?;
    for dir in &args.mkdirs {
        layer.mkdir(dir, &ctx)?;
    }
    for spec in &args.writes {
        let (path, file) = parse_edit(spec)?;
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        layer.write(path, &bytes, &ctx)?;
    }
    for spec in &args.appends {
        let (path, file) = parse_edit(spec)?;
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        layer.append(path, &bytes, &ctx)?;
    }
    for path in &args.executables {
        layer.set_mode(path, EntryMode::Executable, &ctx)?;
    }
    for path in &args.deletes {
        layer.delete(path, &ctx)?;
    }

    let summary = layer.summary();
    let digest = layer.commit(&ctx)?;
    if let Some(tag) = &args.tag {
        engine.tag(tag, &digest)?;
    }

    if format == OutputFormat::Json {
        return print_json(&json!({
            "layer": digest.to_hex(),
            "base": base.map(|b| b.to_hex()),
            "tag": args.tag,
            "changes": summary_json(&summary),
        }));
    }
    println!(
        "{} Committed layer {}",
        "✓".green().bold(),
        digest.short_hex().yellow()
    );
    for path in &summary.added {
        println!("  {} {}", "added:".green(), path);
    }
    for path in &summary.modified {
        println!("  {} {}", "modified:".yellow(), path);
    }
    for path in &summary.deleted {
        println!("  {} {}", "deleted:".red(), path);
    }
    if let Some(tag) = &args.tag {
        println!("  Tagged: {}", tag.cyan());
    }
    Ok(())
}

fn cmd_ls(engine: &Engine, args: LsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let tip = engine.resolve_target(&args.target)?;
    let dir = LayerPath::parse(&args.path)?;
    let names = engine.list_dir(Some(tip), dir.as_str())?;

    if format == OutputFormat::Json || args.long {
        let mut entries = Vec::with_capacity(names.len());
        for name in &names {
            entries.push(engine.resolve_path(Some(tip), dir.join(name)?.as_str())?);
        }
        if format == OutputFormat::Json {
            return print_json(&Value::Array(entries.iter().map(entry_json).collect()));
        }
        for entry in &entries {
            let name = entry.path.file_name().unwrap_or_default();
            let name = if entry.is_dir() {
                format!("{name}/").blue().bold().to_string()
            } else {
                name.to_string()
            };
            println!(
                "{} {:>10}  {:<16} {}",
                entry.meta.mode,
                entry.meta.size,
                entry.source.to_string().dimmed(),
                name
            );
        }
        return Ok(());
    }

    for name in &names {
        println!("{name}");
    }
    Ok(())
}

fn cmd_cat(engine: &Engine, args: CatArgs) -> anyhow::Result<()> {
    let tip = engine.resolve_target(&args.target)?;
    let bytes = engine.read(Some(tip), &args.path)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_stat(engine: &Engine, args: StatArgs, format: OutputFormat) -> anyhow::Result<()> {
    let tip = engine.resolve_target(&args.target)?;
    let entry = engine.resolve_path(Some(tip), &args.path)?;

    if format == OutputFormat::Json {
        return print_json(&entry_json(&entry));
    }
    println!("  Path:    {}", entry.path.as_str().bold());
    println!("  Kind:    {} ({})", kind(entry.meta.mode), entry.meta.mode);
    if !entry.is_dir() {
        println!("  Size:    {}", entry.meta.size);
        println!("  Content: {}", entry.meta.content.to_hex().dimmed());
    }
    println!("  Mtime:   {}", entry.meta.mtime);
    println!("  Source:  {}", entry.source.to_string().yellow());
    Ok(())
}

fn cmd_chain(engine: &Engine, args: ChainArgs, format: OutputFormat) -> anyhow::Result<()> {
    let tip = engine.resolve_target(&args.target)?;
    let chain = engine.chain(&tip)?;

    let mut layers = Vec::with_capacity(chain.len());
    for digest in chain.top_down() {
        layers.push(engine.layer(digest)?);
    }

    if format == OutputFormat::Json {
        let json: Vec<Value> = layers
            .iter()
            .map(|layer| {
                json!({
                    "layer": layer.digest().to_hex(),
                    "parent": layer.parent().map(|p| p.to_hex()),
                    "entries": layer.len(),
                    "content_bytes": layer.content_size(),
                })
            })
            .collect();
        return print_json(&Value::Array(json));
    }
    println!("Chain of {} ({} layers)", args.target.bold(), chain.len());
    for (depth, layer) in layers.iter().enumerate() {
        let marker = if depth == 0 { "tip " } else { "    " };
        println!(
            "  {}{}  {} entries, {} bytes",
            marker.green(),
            layer.digest().short_hex().yellow(),
            layer.len(),
            layer.content_size()
        );
    }
    Ok(())
}

fn cmd_export(engine: &Engine, args: ExportArgs, format: OutputFormat) -> anyhow::Result<()> {
    let tip = engine.resolve_target(&args.target)?;

    if let Some(out) = &args.out {
        let stats = engine.materialize(Some(tip), out)?;
        if format == OutputFormat::Json {
            return print_json(&json!({
                "layer": tip.to_hex(),
                "out": out.display().to_string(),
                "stats": stats,
            }));
        }
        println!(
            "{} Materialized {} into {}",
            "✓".green().bold(),
            tip.short_hex().yellow(),
            out.display().to_string().bold()
        );
        println!(
            "  {} files, {} dirs, {} symlinks, {} bytes",
            stats.files, stats.dirs, stats.symlinks, stats.bytes
        );
        return Ok(());
    }

    let entries = engine.export(Some(tip))?;
    if format == OutputFormat::Json {
        return print_json(&Value::Array(entries.iter().map(entry_json).collect()));
    }
    for entry in &entries {
        println!(
            "{} {:>10}  {}",
            entry.meta.mode,
            entry.meta.size,
            entry.path.as_str()
        );
    }
    Ok(())
}

fn cmd_tag(engine: &Engine, args: TagArgs, format: OutputFormat) -> anyhow::Result<()> {
    let Some(name) = args.name else {
        return list_tags(engine, format);
    };

    if args.delete {
        let digest = engine.untag(&name)?;
        if format == OutputFormat::Json {
            return print_json(&json!({ "deleted": name, "layer": digest.to_hex() }));
        }
        println!(
            "{} Deleted ref {} (was {})",
            "✓".green(),
            name.cyan(),
            digest.short_hex().dimmed()
        );
        return Ok(());
    }

    let Some(target) = args.target else {
        bail!("missing target for ref {name:?}");
    };
    let digest = engine.resolve_target(&target)?;
    let previous = engine.tag(&name, &digest)?;
    if format == OutputFormat::Json {
        return print_json(&json!({
            "ref": name,
            "layer": digest.to_hex(),
            "previous": previous.map(|p| p.to_hex()),
        }));
    }
    match previous {
        Some(previous) if previous != digest => println!(
            "{} Moved {} {} -> {}",
            "✓".green(),
            name.cyan(),
            previous.short_hex().dimmed(),
            digest.short_hex().yellow()
        ),
        _ => println!(
            "{} Tagged {} as {}",
            "✓".green(),
            digest.short_hex().yellow(),
            name.cyan()
        ),
    }
    Ok(())
}

fn list_tags(engine: &Engine, format: OutputFormat) -> anyhow::Result<()> {
    let tags = engine.tags();
    if format == OutputFormat::Json {
        let map: serde_json::Map<String, Value> = tags
            .into_iter()
            .map(|(name, digest)| (name, Value::String(digest.to_hex())))
            .collect();
        return print_json(&Value::Object(map));
    }
    if tags.is_empty() {
        println!("No refs.");
    }
    for (name, digest) in tags {
        println!("  {}  {}", digest.short_hex().yellow(), name.cyan());
    }
    Ok(())
}

fn cmd_layers(engine: &Engine, args: LayersArgs, format: OutputFormat) -> anyhow::Result<()> {
    let registry = engine.registry();
    let digests = if args.tips {
        registry.tips()
    } else {
        registry.digests()
    };
    let tags = engine.tags();
    let names_of = |digest: &Digest| -> Vec<String> {
        tags.iter()
            .filter(|(_, d)| d == digest)
            .map(|(name, _)| name.clone())
            .collect()
    };

    if format == OutputFormat::Json {
        let mut json = Vec::with_capacity(digests.len());
        for digest in &digests {
            let layer = engine.layer(digest)?;
            json.push(json!({
                "layer": digest.to_hex(),
                "parent": layer.parent().map(|p| p.to_hex()),
                "entries": layer.len(),
                "refs": names_of(digest),
            }));
        }
        return print_json(&Value::Array(json));
    }
    if digests.is_empty() {
        println!("No layers.");
    }
    for digest in &digests {
        let layer = engine.layer(digest)?;
        let parent = layer
            .parent()
            .map(|p| p.short_hex())
            .unwrap_or_else(|| "-".to_string());
        let refs = names_of(digest);
        let refs = if refs.is_empty() {
            String::new()
        } else {
            format!(" ({})", refs.join(", ")).cyan().to_string()
        };
        println!(
            "  {}  parent {}  {} entries{}",
            digest.short_hex().yellow(),
            parent.dimmed(),
            layer.len(),
            refs
        );
    }
    Ok(())
}

async fn cmd_gc(engine: &Engine, args: GcArgs, format: OutputFormat) -> anyhow::Result<()> {
    if args.dry_run {
        let unreachable = engine.unreachable();
        if format == OutputFormat::Json {
            let hex: Vec<String> = unreachable.iter().map(Digest::to_hex).collect();
            return print_json(&json!({ "unreachable": hex }));
        }
        println!("{} layers would be unregistered", unreachable.len().to_string().bold());
        for digest in &unreachable {
            println!("  {}", digest.short_hex().dimmed());
        }
        return Ok(());
    }

    let report = run_once(Arc::new(engine.collector()), engine.refs().roots()).await?;
    if format == OutputFormat::Json {
        let hex: Vec<String> = report.unregistered.iter().map(Digest::to_hex).collect();
        return print_json(&json!({
            "unregistered": hex,
            "layers_live": report.layers_live,
            "layers_reclaimed": report.layers_reclaimed,
            "blobs_reclaimed": report.blobs_reclaimed,
            "bytes_reclaimed": report.bytes_reclaimed,
            "failed": report.failed,
        }));
    }
    println!(
        "{} GC: {} layers unregistered, {} objects removed ({} bytes)",
        "✓".green(),
        report.unregistered.len(),
        report.reclaimed_count(),
        report.bytes_reclaimed
    );
    println!("  Live layers: {}", report.layers_live);
    if report.failed > 0 {
        println!(
            "  {} {} objects could not be deleted; they are retried next run",
            "!".yellow().bold(),
            report.failed
        );
    }
    Ok(())
}

fn cmd_stats(engine: &Engine, format: OutputFormat) -> anyhow::Result<()> {
    let stats = engine.stats();
    if format == OutputFormat::Json {
        return print_json(&serde_json::to_value(stats)?);
    }
    println!("  Layers:       {} ({} tips)", stats.layers, stats.tips);
    println!("  Refs:         {}", stats.refs);
    println!("  Objects:      {} ({} blobs)", stats.objects, stats.blobs);
    println!("  Bytes:        {}", stats.bytes);
    println!("  Unreferenced: {}", stats.unreferenced);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_specs_split_on_the_first_equals() {
        let (path, file) = parse_edit("/etc/motd=motd=v2.txt").unwrap();
        assert_eq!(path, "/etc/motd");
        assert_eq!(file, Path::new("motd=v2.txt"));
        assert!(parse_edit("/etc/motd").is_err());
        assert!(parse_edit("=file").is_err());
        assert!(parse_edit("/etc/motd=").is_err());
    }

    #[test]
    fn config_falls_back_to_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path(), None).unwrap();
        assert_eq!(config.root.as_deref(), Some(dir.path()));

        let missing = dir.path().join("nope.toml");
        assert!(load_config(dir.path(), Some(&missing)).is_err());
    }

    #[test]
    fn config_file_in_root_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[gc]\nenabled = false\n").unwrap();
        let config = load_config(dir.path(), None).unwrap();
        assert!(!config.gc.enabled);
        assert_eq!(config.root.as_deref(), Some(dir.path()));
    }

    #[test]
    fn opening_requires_an_initialized_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(open_engine(EngineConfig::at(&missing)).is_err());

        cmd_init(&missing, &InitArgs { force: false }, OutputFormat::Json).unwrap();
        assert!(missing.join(CONFIG_FILE).exists());
        let engine = open_engine(load_config(&missing, None).unwrap()).unwrap();
        assert_eq!(engine.stats().layers, 0);
    }

    #[test]
    fn apply_commits_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        cmd_init(&root, &InitArgs { force: false }, OutputFormat::Json).unwrap();
        let engine = open_engine(load_config(&root, None).unwrap()).unwrap();

        let motd = dir.path().join("motd.txt");
        std::fs::write(&motd, b"hello").unwrap();
        let args = ApplyArgs {
            base: None,
            writes: vec![format!("/etc/motd={}", motd.display())],
            appends: vec![],
            mkdirs: vec!["/var/log".into()],
            deletes: vec![],
            executables: vec![],
            tag: Some("base:1".into()),
            timeout_ms: None,
        };
        cmd_apply(&engine, args, OutputFormat::Json).unwrap();

        let tip = engine.resolve_target("base:1").unwrap();
        assert_eq!(engine.read(Some(tip), "/etc/motd").unwrap(), b"hello");
        assert!(engine.resolve_path(Some(tip), "/var/log").unwrap().is_dir());
    }
}
