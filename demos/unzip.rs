use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::*;
use camino::Utf8Path;
use log::*;
use rayon::prelude::*;
use structopt::*;

use seekarc::*;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "unzip",
    about = "Dumps the images in an archive (.cbz, .cbt, .tar.gz, ...) into the current directory"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Change to the given directory before perfoming any operations.
    #[structopt(short = "C", long)]
    directory: Option<PathBuf>,

    /// Prints the playable entries in the archive instead of extracting them.
    #[structopt(short = "n", long)]
    dry_run: bool,

    /// List entries in natural order instead of archive order.
    #[structopt(short, long)]
    sort: bool,

    /// Passphrase for encrypted archives
    #[structopt(short, long)]
    password: Option<String>,

    /// How many decoder cursors to keep around
    #[structopt(long, default_value = "20")]
    cursors: usize,

    #[structopt(name("archive"))]
    archive_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    // Open before changing directories so relative paths still work.
    let archive_file = File::open(&args.archive_path).context("Couldn't open archive")?;
    let len = archive_file.metadata()?.len();

    if let Some(chto) = &args.directory {
        std::env::set_current_dir(chto)
            .with_context(|| format!("Couldn't set working directory to {}", chto.display()))?;
    }

    info!("Memory mapping {:#?}", &args.archive_path);
    let options = Options {
        sort_entries: args.sort,
        context_pool_capacity: args.cursors,
        ..Default::default()
    };
    let mut session =
        ArchiveSession::open(&archive_file, len, options).context("Couldn't load archive")?;

    if session.needs_password() {
        let password = args
            .password
            .as_deref()
            .ok_or_else(|| anyhow!("Archive is encrypted; pass --password"))?;
        session.provide_password(password)?;
    }

    if args.dry_run {
        print_entries(&session)
    } else {
        dump(&session)
    }
}

fn print_entries(session: &ArchiveSession) -> Result<()> {
    for entry in session.entries() {
        let stored = if entry.zero_copy.is_some() { " (stored)" } else { "" };
        println!("{} {}{}", entry.size, entry.name, stored);
    }
    Ok(())
}

fn dump(session: &ArchiveSession) -> Result<()> {
    (0..session.len()).into_par_iter().try_for_each(|i| {
        let entry = &session.entries()[i];
        let path = Utf8Path::new(&entry.name);
        if path.is_absolute() || path.components().any(|c| c.as_str() == "..") {
            warn!("Skipping {}, which would land outside this directory", path);
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {}", parent))?;
        }
        let sink = File::create(path).with_context(|| format!("Couldn't create file {}", path))?;
        session
            .extract_to_file(i, &sink)
            .with_context(|| format!("Couldn't extract {}", path))?;
        Ok(())
    })?;

    let stats = session.decoder_pool().stats();
    info!(
        "{} cursor hits, {} misses, {} evictions",
        stats.hits, stats.misses, stats.evictions
    );
    Ok(())
}
