//! Purpose: Describe a star-shaped set of tabular files and open joined readers over them.
//! Exports: `Archive`, `ArchiveFile`, `FileReader`, `StarIterator`.
//! Role: Glue between a caller-supplied descriptor and the core tokenizer/sort/join stages.
//! Invariants: Every file that declares a quote character is read through its sorted artifact.
//! Invariants: Descriptor parsing is plain serde; no other metadata format is interpreted.
use std::fs;
use std::fs::File;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::TabularFormat;
use crate::core::mapped::MappedReader;
use crate::core::reader::RowReader;
use crate::core::sort::{self, SortOptions};
use crate::core::star::{JoinOptions, Keyed, StarJoin};
use crate::core::tokenizer::Tokenizer;

pub type FileReader<K> = MappedReader<Tokenizer<File>, K>;
pub type StarIterator<K> = StarJoin<FileReader<K>, K>;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFile<K> {
    /// Extension name used as the group key in star records.
    pub name: String,
    pub location: PathBuf,
    #[serde(default)]
    pub format: TabularFormat,
    /// Index of the id (core) or coreid (extension) column.
    pub id_column: usize,
    pub columns: Vec<K>,
}

impl<K> ArchiveFile<K>
where
    K: Clone + Eq + Hash,
{
    pub fn id_key(&self) -> Result<&K, Error> {
        self.columns.get(self.id_column).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "id column {} of '{}' has no declared key",
                    self.id_column, self.name
                ))
                .with_path(&self.location)
        })
    }

    pub fn sorted_location(&self) -> PathBuf {
        sort::sorted_path(&self.location)
    }

    pub fn normalize_and_sort(&self, options: SortOptions) -> Result<Option<bool>, Error> {
        sort::normalize_and_sort(&self.location, &self.format, self.id_column, options)
    }

    /// Path of the sorted artifact, producing it when missing; `None` for files read as is.
    pub fn normalize_if_required(&self, options: SortOptions) -> Result<Option<PathBuf>, Error> {
        Ok(self
            .normalize_and_sort(options)?
            .map(|_| self.sorted_location()))
    }

    /// Rows of this file in source order.
    pub fn rows(&self) -> Result<FileReader<K>, Error> {
        self.open_at(&self.location)
    }

    fn open_at(&self, path: &Path) -> Result<FileReader<K>, Error> {
        let tokenizer = Tokenizer::open(path, &self.format)?;
        sort::check_key_column(tokenizer.header(), self.id_column)
            .map_err(|err| err.with_path(path))?;
        Ok(MappedReader::new(tokenizer, self.columns.clone()))
    }

    fn keyed(&self, options: SortOptions) -> Result<Keyed<FileReader<K>, K>, Error> {
        let id = self.id_key()?.clone();
        let path = self
            .normalize_if_required(options)?
            .unwrap_or_else(|| self.location.clone());
        Ok(Keyed::new(self.open_at(&path)?, id))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: Deserialize<'de>"))]
pub struct Archive<K> {
    pub core: ArchiveFile<K>,
    #[serde(default)]
    pub extensions: Vec<ArchiveFile<K>>,
    #[serde(default)]
    pub sort: SortOptions,
}

impl<K> Archive<K>
where
    K: Clone + Eq + Hash + DeserializeOwned,
{
    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid archive descriptor")
                .with_source(err)
        })
    }

    /// Loads a descriptor; relative file locations resolve against its directory.
    pub fn from_json_path(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::io(err, "failed to read archive descriptor").with_path(path))?;
        let mut archive = Self::from_json(&text).map_err(|err| err.with_path(path))?;
        if let Some(base) = path.parent() {
            archive.core.location = base.join(&archive.core.location);
            for extension in &mut archive.extensions {
                extension.location = base.join(&extension.location);
            }
        }
        Ok(archive)
    }
}

impl<K> Archive<K>
where
    K: Clone + Eq + Hash,
{
    pub fn core(&self) -> &ArchiveFile<K> {
        &self.core
    }

    pub fn extensions(&self) -> &[ArchiveFile<K>] {
        &self.extensions
    }

    pub fn extension(&self, name: &str) -> Option<&ArchiveFile<K>> {
        self.extensions.iter().find(|file| file.name == name)
    }

    /// Checks that every declared file exists and has a usable id column.
    pub fn validate(&self) -> Result<(), Error> {
        for file in std::iter::once(&self.core).chain(&self.extensions) {
            file.id_key()?;
            file.format.validate()?;
            if !file.location.is_file() {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message(format!("data file of '{}' is missing", file.name))
                    .with_path(&file.location));
            }
        }
        Ok(())
    }

    /// Star records for every core row, normalizing files first where needed.
    pub fn star_iter(&self, include_extensions: bool) -> Result<StarIterator<K>, Error> {
        let options = if include_extensions {
            JoinOptions::default()
        } else {
            JoinOptions::core_only()
        };
        self.star_iter_with(options)
    }

    pub fn star_iter_with(&self, options: JoinOptions<K>) -> Result<StarIterator<K>, Error> {
        self.validate()?;
        let core = self.core.keyed(self.sort)?;
        let mut extensions = Vec::new();
        if options.include_extensions {
            for file in &self.extensions {
                extensions.push((file.name.clone(), file.keyed(self.sort)?));
            }
        }
        info!(
            core = %self.core.name,
            extensions = extensions.len(),
            "opened star join"
        );
        Ok(StarJoin::new(core, extensions, options))
    }
}
