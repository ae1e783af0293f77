use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use selecta::analyzer::decode::FfmpegSource;
use selecta::analyzer::spectral::SpectralEmbedder;
use selecta::analyzer::{ExtractError, ModelExtractor};
use selecta::categorize::RoundReport;
use selecta::db::Database;
use selecta::similarity::{Aggregation, SimilarityMatrix};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "selecta", version, about = "Acoustic similarity and active-learning categorization for music libraries")]
struct Cli {
    /// Path to the SQLite database (overrides the per-library default)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Library root(s); selects the per-library database
    #[arg(short = 'L', long, global = true)]
    library: Vec<String>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan library roots for audio files (<root>/<category>/<file>)
    Scan {
        /// Directories to scan (defaults to --library or the config file)
        paths: Vec<String>,

        /// Re-register files even if they haven't changed
        #[arg(long)]
        force: bool,
    },

    /// Extract and cache collapsed embeddings for tracks that lack one
    Analyze {
        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Re-extract every track
        #[arg(long)]
        force: bool,
    },

    /// Bring the track-to-track similarity matrix up to date
    Similarity {
        /// How a pair's row distances are reduced (defaults to config)
        #[arg(short, long, value_enum)]
        aggregation: Option<Aggregation>,

        /// Discard the stored matrix and recompute every pair
        #[arg(long)]
        rebuild: bool,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Find tracks that sound similar to a given track
    Similar {
        /// Track name or path (substring match)
        track: String,

        /// Number of results
        #[arg(short = 'n', long, default_value = "15")]
        limit: usize,
    },

    /// Cluster analyzed tracks with k-means (advisory partition)
    Bootstrap {
        /// Number of clusters
        #[arg(short, long)]
        k: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        #[arg(long, default_value = "100")]
        max_iter: usize,
    },

    /// Categorize tracks with the active-learning loop
    Categorize {
        /// Confidence needed to accept a prediction
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Least-confident tracks escalated per round
        #[arg(short, long)]
        escalate: Option<usize>,

        /// Seed roots per category
        #[arg(short, long)]
        roots: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Spread seed roots across this many k-means clusters
        #[arg(long)]
        clusters: Option<usize>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Print round reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create, list, export or delete playlists
    Playlist {
        #[command(subcommand)]
        action: PlaylistAction,
    },

    /// Remove a track from the library and prune it from the matrix
    Remove {
        /// Exact track name or path
        track: String,
    },

    /// Show library statistics
    Stats,
}

#[derive(Subcommand)]
enum PlaylistAction {
    /// Root track followed by its closest neighbors
    Create {
        name: String,

        /// Root track name
        #[arg(long)]
        root: String,

        /// Number of tracks, root included
        #[arg(short = 'n', long, default_value = "20")]
        size: usize,
    },
    List,
    /// Print a playlist as JSON
    Export {
        name: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Delete {
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = selecta::config::AppConfig::load();

    // Library roots: --library > scan args > config
    let scan_paths = match &cli.command {
        Commands::Scan { paths, .. } => paths.clone(),
        _ => Vec::new(),
    };
    let roots: Vec<String> = if !cli.library.is_empty() {
        cli.library.clone()
    } else if !scan_paths.is_empty() {
        scan_paths
    } else {
        config.library.iter().map(|p| p.to_string_lossy().to_string()).collect()
    };

    // Resolve database path: CLI > config > per-library XDG default
    let db_path = match cli.db_path.clone().or(config.db_path.clone()) {
        Some(path) => path,
        None if !roots.is_empty() => {
            selecta::config::default_db_path(&selecta::scanner::library_key(&roots))
        }
        None => anyhow::bail!(
            "No library selected. Pass --library, --db-path, or set library in config."
        ),
    };
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path).context("Failed to open database")?;

    let source = config.extraction.source();
    let init = || -> std::result::Result<_, ExtractError> {
        Ok(ModelExtractor::new(source.clone(), SpectralEmbedder::default()))
    };

    match cli.command {
        Commands::Scan { force, .. } => {
            if roots.is_empty() {
                anyhow::bail!(
                    "No directories to scan. Pass paths as arguments or set library in config."
                );
            }
            let result = selecta::scanner::scan(&db, &roots, force).context("Scan failed")?;
            println!(
                "Scan complete: {} scanned, {} new, {} updated, {} skipped, {} errors",
                result.scanned, result.new, result.updated, result.skipped, result.errors
            );
        }

        Commands::Analyze { jobs, force } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            check_ffmpeg(&source);
            let result = selecta::analyzer::analyze_tracks(
                &db,
                force,
                workers,
                config.extraction.group_size,
                init,
            )
            .context("Analysis failed")?;
            println!(
                "Analysis complete: {} analyzed, {} failed",
                result.analyzed, result.failed
            );
        }

        Commands::Similarity { aggregation, rebuild, jobs } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let aggregation = aggregation.unwrap_or(config.similarity.aggregation);
            let result = selecta::similarity::update_similarity(&db, aggregation, rebuild, workers)
                .context("Similarity computation failed")?;
            println!(
                "Similarity complete: {} tracks ({} new, {} aggregation), {} pairs stored",
                result.tracks, result.new_tracks, aggregation, result.pairs
            );
            if !result.excluded.is_empty() {
                println!("Excluded {} tracks whose extraction failed:", result.excluded.len());
                for name in &result.excluded {
                    println!("  {}", name);
                }
            }
        }

        Commands::Similar { track, limit } => {
            let found = db.find_tracks(&track).context("Search failed")?;
            let target = match found.as_slice() {
                [] => {
                    println!("No track matching \"{}\".", track);
                    return Ok(());
                }
                [one] => one,
                many => {
                    println!("\"{}\" matches {} tracks; be more specific:", track, many.len());
                    for t in many.iter().take(10) {
                        println!("  {}", t.name);
                    }
                    return Ok(());
                }
            };

            let Some(cache) = db.load_similarity().context("Query failed")? else {
                println!("No similarity data. Run `selecta similarity` first.");
                return Ok(());
            };
            let matrix = SimilarityMatrix::from_cache(cache).context("Stored matrix is unusable")?;
            let results = matrix.nearest(&target.name, limit).context("Query failed")?;

            println!("Tracks similar to \"{}\":", target.name);
            println!();
            println!("{:<50} {:>8}", "Track", "Dist");
            println!("{}", "-".repeat(59));
            for n in &results {
                println!("{:<50} {:>8.4}", truncate(&n.name, 50), n.distance);
            }
            println!();
            println!("Dist = cosine distance (0 = identical, lower = more similar)");
        }

        Commands::Bootstrap { k, seed, max_iter } => {
            let arena = db.build_arena().context("Failed to load embeddings")?;
            let result = selecta::bootstrap::bootstrap(&arena, k, seed, max_iter)
                .context("Clustering failed")?;

            println!(
                "k-means: {} clusters over {} tracks, {} iterations, inertia {:.4}",
                k,
                arena.len(),
                result.iterations,
                result.inertia
            );
            for (cluster, size) in result.cluster_sizes(k).iter().enumerate() {
                println!();
                println!("Cluster {} ({} tracks)", cluster, size);
                for (id, _) in result.assignments.iter().filter(|(_, c)| **c == cluster) {
                    let track = arena.get(*id);
                    match &track.true_category {
                        Some(category) => println!("  {} [{}]", track.name, category),
                        None => println!("  {}", track.name),
                    }
                }
            }
        }

        Commands::Categorize { threshold, escalate, roots: num_roots, seed, clusters, jobs, json } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let mut params = config.categorize.loop_params();
            if let Some(t) = threshold {
                params.threshold = t;
            }
            if let Some(m) = escalate {
                params.escalation_size = m;
            }
            if let Some(r) = num_roots {
                params.num_roots = r;
            }
            if let Some(s) = seed {
                params.seed = s;
                params.train.seed = s;
            }

            let partition: Option<BTreeMap<String, usize>> = match clusters {
                Some(k) => {
                    let arena = db.build_arena().context("Failed to load embeddings")?;
                    let result = selecta::bootstrap::bootstrap(&arena, k, params.seed, 100)
                        .context("Clustering failed")?;
                    Some(
                        result
                            .assignments
                            .iter()
                            .map(|(id, c)| (arena.get(*id).key.clone(), *c))
                            .collect(),
                    )
                }
                None => None,
            };

            check_ffmpeg(&source);
            let result = selecta::categorize::categorize_library(
                &db,
                params,
                config.extraction.frame_settings(),
                partition.as_ref(),
                workers,
                init,
            )
            .context("Categorization failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result.outcome)?);
                return Ok(());
            }

            print_round_table(&result.outcome.reports);
            println!();
            println!(
                "Categorization complete: {} tracks in {} rounds, {} roots",
                result.tracks, result.outcome.rounds, result.outcome.roots
            );
            match result.outcome.accuracy {
                Some(acc) => println!("Accuracy: {:.1}%", acc * 100.0),
                None => println!("Accuracy: n/a (every track is a root)"),
            }
            if result.uncategorized > 0 {
                println!("Skipped {} tracks outside a category directory", result.uncategorized);
            }
            if result.failed > 0 {
                println!("Excluded {} tracks whose frames could not be extracted", result.failed);
            }
        }

        Commands::Playlist { action } => match action {
            PlaylistAction::Create { name, root, size } => {
                let found = db.find_tracks(&root).context("Search failed")?;
                let [track] = found.as_slice() else {
                    anyhow::bail!("\"{}\" matches {} tracks; give an exact name", root, found.len());
                };
                let playlist = selecta::playlist::create(&db, &name, &track.name, size)
                    .context("Failed to create playlist")?;
                println!("Playlist \"{}\" ({} tracks):", playlist.name, playlist.tracks.len());
                for (i, t) in playlist.tracks.iter().enumerate() {
                    match t.distance {
                        Some(d) => println!("{:>3}. {:<50} {:>8.4}", i + 1, truncate(&t.name, 50), d),
                        None => println!("{:>3}. {:<50} {:>8}", i + 1, truncate(&t.name, 50), "root"),
                    }
                }
            }
            PlaylistAction::List => {
                let playlists = db.list_playlists().context("Query failed")?;
                if playlists.is_empty() {
                    println!("No playlists.");
                    return Ok(());
                }
                println!("{:<30} {:>6}  {:<30} {}", "Name", "Tracks", "Root", "Created");
                println!("{}", "-".repeat(90));
                for p in &playlists {
                    println!(
                        "{:<30} {:>6}  {:<30} {}",
                        truncate(&p.name, 30),
                        p.track_count,
                        truncate(p.root.as_deref().unwrap_or("(removed)"), 30),
                        p.created_at
                    );
                }
            }
            PlaylistAction::Export { name, output } => {
                let json = selecta::playlist::export_json(&db, &name).context("Export failed")?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, json)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!("Wrote {}", path.display());
                    }
                    None => println!("{}", json),
                }
            }
            PlaylistAction::Delete { name } => {
                if db.delete_playlist(&name).context("Delete failed")? {
                    println!("Deleted playlist \"{}\".", name);
                } else {
                    println!("No playlist named \"{}\".", name);
                }
            }
        },

        Commands::Remove { track } => {
            let found = db.find_tracks(&track).context("Search failed")?;
            let [target] = found.as_slice() else {
                anyhow::bail!("\"{}\" matches {} tracks; give an exact name", track, found.len());
            };

            let cached = db.load_similarity().context("Failed to load similarity matrix")?;
            db.remove_track(target.id).context("Failed to remove track")?;
            // Cascading deletes drop its pairs; re-store to keep positions contiguous
            if let Some(cache) = cached {
                let matrix = SimilarityMatrix::from_cache(cache).context("Stored matrix is unusable")?;
                db.store_similarity(&matrix.without(&target.track_key))
                    .context("Failed to store pruned matrix")?;
            }
            println!("Removed \"{}\".", target.name);
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Library Statistics");
            println!("==================");
            println!("Total tracks:       {}", stats.total_tracks);
            println!("Embedded tracks:    {}", stats.embedded_tracks);
            println!("Failed extractions: {}", stats.failed_tracks);
            println!("In similarity:      {}", stats.similarity_tracks);
            println!("Categorized:        {}", stats.labeled_tracks);
            println!("Playlists:          {}", stats.playlists);
            println!();

            if !stats.formats.is_empty() {
                println!("Formats:");
                for (fmt, count) in &stats.formats {
                    println!("  {:<8} {}", fmt, count);
                }
                println!();
            }

            if !stats.categories.is_empty() {
                println!("Categories:");
                for (category, count) in &stats.categories {
                    println!("  {:<30} {}", category, count);
                }
            }
        }
    }

    Ok(())
}

fn check_ffmpeg(source: &FfmpegSource) {
    let found = std::process::Command::new(&source.ffmpeg)
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !found {
        log::warn!("{} not runnable; every extraction will fail", source.ffmpeg.display());
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

/// Print one line per active-learning round.
fn print_round_table(reports: &[RoundReport]) {
    println!(
        "{:>5} {:>8} {:>8} {:>9} {:>9} {:>9} {:>8} {:>8}",
        "Round", "Trained", "Rows", "Promoted", "Escalated", "Remaining", "MeanConf", "Acc"
    );
    println!("{}", "-".repeat(72));

    for r in reports {
        let pct = |v: Option<f64>| v.map(|v| format!("{:.1}%", v * 100.0)).unwrap_or_else(|| "-".into());
        println!(
            "{:>5} {:>8} {:>8} {:>9} {:>9} {:>9} {:>8} {:>8}",
            r.round,
            r.trained_on,
            r.training_rows,
            r.promoted,
            r.escalated,
            r.remaining,
            r.mean_confidence.map(|c| format!("{:.3}", c)).unwrap_or_else(|| "-".into()),
            pct(r.accuracy),
        );
    }
}
