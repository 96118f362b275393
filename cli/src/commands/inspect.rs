//! `layerscan inspect` command.

use std::path::PathBuf;

use clap::Args;
use layerscan_runtime::{collect_inventory, ArchiveSource, ImageArchive, ImageInventory};

use crate::output;

#[derive(Args)]
pub struct InspectArgs {
    /// Saved image archive (`docker save` output)
    pub archive: PathBuf,

    /// Image to inspect when the archive holds several
    #[arg(short, long)]
    pub tag: Option<String>,

    /// List installed packages
    #[arg(short, long)]
    pub packages: bool,

    /// Print the inventory as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let path = args.archive.clone();
    let tag = args.tag.clone();
    let inventory = tokio::task::spawn_blocking(move || {
        let archive = match tag {
            Some(tag) => ImageArchive::open_tagged(ArchiveSource::from(path), &tag)?,
            None => ImageArchive::open(&path)?,
        };
        collect_inventory(&archive)
    })
    .await??;

    let Some(inventory) = inventory else {
        println!(
            "{}: no OS release or dpkg database found, not applicable",
            args.archive.display()
        );
        return Ok(());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&inventory)?);
        return Ok(());
    }

    print_inventory(&inventory, args.packages);
    Ok(())
}

fn print_inventory(inventory: &ImageInventory, packages: bool) {
    let mut table = output::new_table(&["FIELD", "VALUE"]);
    table.add_row(vec!["Tags".to_string(), inventory.tags.join(", ")]);
    table.add_row(vec!["Layers".to_string(), inventory.layers.join(", ")]);
    table.add_row(vec!["OS".to_string(), inventory.operating_system()]);
    if let Some(pretty) = &inventory.os_release.pretty_name {
        table.add_row(vec!["Pretty name".to_string(), pretty.clone()]);
    }
    if let Some(cpe) = &inventory.os_release.cpe_id {
        table.add_row(vec!["CPE".to_string(), cpe.clone()]);
    }
    table.add_row(vec!["Packages".to_string(), inventory.packages.len().to_string()]);
    println!("{table}");

    if packages {
        let mut table = output::new_table(&["PACKAGE", "VERSION", "ARCH"]);
        for package in &inventory.packages {
            table.add_row(vec![&package.name, &package.version, &package.architecture]);
        }
        println!();
        println!("{table}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::{Builder, Header};

    fn member(builder: &mut Builder<Vec<u8>>, path: &str, content: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content).unwrap();
    }

    fn saved_image() -> Vec<u8> {
        let mut layer = Builder::new(Vec::new());
        member(&mut layer, "etc/os-release", b"ID=debian\nVERSION_ID=\"12\"\n");
        member(
            &mut layer,
            "var/lib/dpkg/status",
            b"Package: bash\nVersion: 5.2.15-2\nArchitecture: amd64\n",
        );
        let layer = layer.into_inner().unwrap();

        let mut image = Builder::new(Vec::new());
        member(
            &mut image,
            "manifest.json",
            br#"[{"Config":"c.json","RepoTags":["debian:12"],"Layers":["l1/layer.tar"]}]"#,
        );
        member(&mut image, "c.json", b"{}");
        member(&mut image, "l1/layer.tar", &layer);
        image.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_inspect_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debian.tar");
        std::fs::write(&path, saved_image()).unwrap();

        for (tag, json) in [(None, false), (Some("debian:12".to_string()), true)] {
            let args = InspectArgs {
                archive: path.clone(),
                tag,
                packages: true,
                json,
            };
            execute(args).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_inspect_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let args = InspectArgs {
            archive: dir.path().join("absent.tar"),
            tag: None,
            packages: false,
            json: false,
        };
        assert!(execute(args).await.is_err());
    }
}
