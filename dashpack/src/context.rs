use anyhow::{anyhow, Context, Result};
use ignore::WalkBuilder;
use log::{debug, info};
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};
use tar::{Builder as TarBuilder, EntryType, Header};
use tempfile::TempDir;

use crate::hasher::DigestHasher;

/// File name the rendered recipe gets inside the context archive.
pub const DOCKERFILE_NAME: &str = ".dashpack.Dockerfile";

/// A tarred build context with the rendered recipe inside, ready to be
/// streamed to the container runtime.
pub struct BuildContext {
    dir: TempDir,
    archive: PathBuf,
    digest: String,
    size: u64,
}

impl BuildContext {
    /// Archives every file under `context` that `.dockerignore` doesn't
    /// exclude, in file name order so the digest is reproducible.
    pub fn assemble<P: AsRef<Path>>(context: P, dockerfile: &str) -> Result<BuildContext> {
        let context = context.as_ref();
        let dir = TempDir::new()?;
        let archive = dir.path().join("context.tar");

        let file = {
            let mut options = OpenOptions::new();
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            options.write(true).create(true).open(&archive)?
        };

        let mut tar = TarBuilder::new(file);
        let mut hasher = blake3::Hasher::new();
        hasher.input_bytes(dockerfile.as_bytes());

        let walk = WalkBuilder::new(context)
            .add_custom_ignore_filename(".dockerignore")
            .parents(false)
            .ignore(false)
            .git_global(false)
            .git_ignore(false)
            .git_exclude(false)
            .hidden(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        let mut size = 0;
        for result in walk {
            let entry = result?;
            let path = entry.path();
            let relative = path
                .strip_prefix(context)
                .with_context(|| format!("{:?} is outside the build context", path))?;

            if relative.as_os_str().is_empty() || relative == Path::new(DOCKERFILE_NAME) {
                continue;
            }

            let name = relative
                .to_str()
                .ok_or_else(|| anyhow!("context path {:?} is not valid utf-8", relative))?;

            let file_type = entry
                .file_type()
                .ok_or_else(|| anyhow!("couldn't determine the file type of {:?}", path))?;

            if file_type.is_dir() {
                tar.append_dir(relative, path)?;
                continue;
            }

            let contents = fs::read(path).with_context(|| format!("couldn't read {:?}", path))?;
            hasher.input_bytes(name.as_bytes());
            hasher.input_bytes(&contents);
            size += contents.len() as u64;

            tar.append_path_with_name(path, relative)?;
            debug!("archived {}", name);
        }

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, DOCKERFILE_NAME, dockerfile.as_bytes())?;

        tar.into_inner()?.sync_all()?;

        let digest = hasher.finalize().to_hex().to_string();
        info!("build context digest {}", digest);

        Ok(BuildContext {
            dir,
            archive,
            digest,
            size,
        })
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Total bytes of archived file contents.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}
