use std::io::{IsTerminal, Write};

use anyhow::{bail, Result};

use crate::build::GolBuilder;
use crate::cli::{BuildArgs, CheckArgs, Cli, InfoArgs};
use crate::common::fs::with_default_extension;
use crate::common::Verbosity;
use crate::store::GolReader;
use crate::BuildSettings;

pub fn build(cli: &Cli, args: &BuildArgs) -> Result<()> {
    let mut settings = BuildSettings::default();
    settings.verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);
    settings.source = with_default_extension(&args.source, "pbf");
    if let Some(levels) = &args.levels {
        settings.set_levels(levels)?;
    }
    if let Some(v) = args.max_tiles {
        settings.set_max_tiles(v)?;
    }
    if let Some(v) = args.min_tile_density {
        settings.set_min_tile_density(v)?;
    }
    if let Some(v) = args.max_strings {
        settings.set_max_strings(v)?;
    }
    if let Some(v) = args.min_string_usage {
        settings.set_min_string_usage(v)?;
    }
    if let Some(rules) = &args.areas {
        settings.set_area_rules(rules)?;
    }
    if let Some(keys) = &args.indexed_keys {
        settings.set_indexed_keys(keys)?;
    }
    if let Some(v) = args.max_key_indexes {
        settings.set_max_key_indexes(v)?;
    }
    if let Some(v) = args.key_index_min_features {
        settings.set_key_index_min_features(v)?;
    }
    if let Some(v) = args.rtree_branch_size {
        settings.set_rtree_branch_size(v)?;
    }
    settings.include_way_node_ids |= args.waynode_ids;
    if args.updatable {
        settings.set_updatable();
    }
    settings.keep_work = args.keep_work;
    settings.thread_count = args.threads;
    settings.complete()?;

    let gol_path = with_default_extension(&args.gol, "gol");
    if gol_path.exists() && !cli.yes && !confirm_replace(&gol_path)? {
        return Ok(());
    }

    if settings.verbosity >= Verbosity::Normal {
        eprintln!(
            "Building {} from {}:",
            gol_path.display(),
            settings.source.display()
        );
    }
    let summary = GolBuilder::new(settings).build(&gol_path)?;
    if cli.verbose > 0 {
        eprintln!(
            "[build] {} nodes, {} ways, {} relations -> {} tiles",
            summary.osm_stats.node_count,
            summary.osm_stats.way_count,
            summary.osm_stats.relation_count,
            summary.tile_count
        );
    }
    if !cli.quiet {
        eprintln!("Done.");
    }
    Ok(())
}

fn confirm_replace(path: &std::path::Path) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        bail!("{} exists already (use --yes to replace it)", path.display());
    }
    eprint!("{} exists already. Replace it? [y/N] ", path.display());
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

pub fn info(_cli: &Cli, args: &InfoArgs) -> Result<()> {
    let reader = GolReader::open(&with_default_extension(&args.gol, "gol"))?;
    let guid: String = reader.meta.guid.iter().map(|b| format!("{b:02x}")).collect();
    println!("guid:            {guid}");
    println!("revision:        {}", reader.meta.revision);
    println!("tiles:           {}", reader.tile_count);
    println!("global strings:  {}", reader.strings.len());
    println!("indexed keys:    {}", reader.indexed_keys.len());
    println!(
        "zoom levels:     {}",
        reader
            .meta
            .zoom_levels
            .iter()
            .map(|z| z.to_string())
            .collect::<Vec<_>>()
            .join("/")
    );
    println!("waynode ids:     {}", if reader.meta.waynode_ids { "yes" } else { "no" });
    Ok(())
}

pub fn check(cli: &Cli, args: &CheckArgs) -> Result<()> {
    let reader = GolReader::open(&with_default_extension(&args.gol, "gol"))?;
    let mut errors = 0u32;
    for pile in 1..=reader.tile_count {
        let (page, compressed_len, raw_len) = reader.tile_blob_extent(pile);
        if page == 0 {
            eprintln!("tile {pile}: missing");
            errors += 1;
            continue;
        }
        if page * crate::store::PAGE_SIZE + compressed_len as u64 > reader.file_len {
            eprintln!("tile {pile}: blob beyond end of file");
            errors += 1;
            continue;
        }
        match reader.load_tile(pile) {
            Err(e) => {
                eprintln!("tile {pile}: {e}");
                errors += 1;
            }
            Ok(blob) => {
                if let Err(e) = crate::build::compile::layout::check_tile_blob(&blob, raw_len) {
                    eprintln!("tile {pile}: {e}");
                    errors += 1;
                }
            }
        }
    }
    if errors > 0 {
        bail!("{} of {} tiles failed the check", errors, reader.tile_count);
    }
    if cli.verbose > 0 || !cli.quiet {
        println!("{} tiles OK", reader.tile_count);
    }
    Ok(())
}
