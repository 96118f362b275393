//! `layerscan images` command.

use std::path::PathBuf;

use clap::Args;
use layerscan_core::config::ScanConfig;
use layerscan_runtime::{DockerClient, ImageSummary};

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image ids
    #[arg(short, long)]
    pub quiet: bool,

    /// Docker engine socket
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

pub async fn execute(args: ImagesArgs, mut config: ScanConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(socket) = args.socket {
        config.docker.socket_path = socket;
    }
    let images = DockerClient::new(&config.docker).list_images().await?;

    if args.quiet {
        for image in &images {
            println!("{}", output::short_id(&image.id));
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"]);
    for image in &images {
        for row in rows(image) {
            table.add_row(row);
        }
    }
    println!("{table}");
    Ok(())
}

/// One row per tag; untagged images get a single `<none>` row.
fn rows(image: &ImageSummary) -> Vec<Vec<String>> {
    let id = output::short_id(&image.id).to_string();
    let created = output::format_unix_ago(image.created);
    let size = output::format_bytes(image.size.max(0) as u64);

    let tags: Vec<(String, String)> = if image.tags().is_empty() {
        vec![("<none>".to_string(), "<none>".to_string())]
    } else {
        image
            .tags()
            .iter()
            .map(|tag| match tag.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
                _ => (tag.clone(), "<none>".to_string()),
            })
            .collect()
    };

    tags.into_iter()
        .map(|(repository, tag)| vec![repository, tag, id.clone(), created.clone(), size.clone()])
        .collect()
}
