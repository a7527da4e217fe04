use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Unit-cell parameters: lengths in Å, angles in degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Lattice {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Lattice {
    pub fn lengths(&self) -> [f64; 3] {
        [self.a, self.b, self.c]
    }

    pub fn angles(&self) -> [f64; 3] {
        [self.alpha, self.beta, self.gamma]
    }
}

/// 晶体结构
///
/// The raw CIF text travels with the parsed header so collaborators that need
/// the full file (zeo++, the relaxation drivers) get it back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Structure {
    pub name: String,
    pub lattice: Lattice,
    pub num_sites: usize,
    pub cif: String,
}

impl Structure {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| FlowError::StructureRead {
            path: path.to_path_buf(),
            source,
        })?;
        let fallback = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("structure");
        Self::from_cif_str(fallback, &text).map_err(|reason| FlowError::StructureParse {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Reads the cell block and counts atom sites. `fallback_name` is used when
    /// the file carries no `data_` block name.
    pub fn from_cif_str(fallback_name: &str, text: &str) -> Result<Self, String> {
        let mut name = None;
        let mut cell = [None; 6];

        for line in text.lines() {
            let line = line.trim();
            if let Some(block) = line.strip_prefix("data_") {
                if name.is_none() && !block.is_empty() {
                    name = Some(block.to_string());
                }
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(tag), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let slot = match tag {
                "_cell_length_a" => 0,
                "_cell_length_b" => 1,
                "_cell_length_c" => 2,
                "_cell_angle_alpha" => 3,
                "_cell_angle_beta" => 4,
                "_cell_angle_gamma" => 5,
                _ => continue,
            };
            cell[slot] = Some(parse_cif_number(value).ok_or_else(|| {
                format!("{} has a non-numeric value '{}'", tag, value)
            })?);
        }

        const TAGS: [&str; 6] = [
            "_cell_length_a",
            "_cell_length_b",
            "_cell_length_c",
            "_cell_angle_alpha",
            "_cell_angle_beta",
            "_cell_angle_gamma",
        ];
        let mut values = [0.0; 6];
        for (i, v) in cell.iter().enumerate() {
            values[i] = v.ok_or_else(|| format!("missing {}", TAGS[i]))?;
        }
        if values[..3].iter().any(|l| *l <= 0.0) {
            return Err("cell lengths must be positive".to_string());
        }
        if values[3..].iter().any(|a| *a <= 0.0 || *a >= 180.0) {
            return Err("cell angles must lie strictly between 0 and 180 degrees".to_string());
        }

        let num_sites = count_atom_sites(text);
        if num_sites == 0 {
            return Err("no atom sites found".to_string());
        }

        Ok(Self {
            name: name.unwrap_or_else(|| fallback_name.to_string()),
            lattice: Lattice {
                a: values[0],
                b: values[1],
                c: values[2],
                alpha: values[3],
                beta: values[4],
                gamma: values[5],
            },
            num_sites,
            cif: text.to_string(),
        })
    }

    /// Writes the CIF text to `dir/file_name` and returns the path.
    pub fn write_cif(&self, dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name);
        fs::write(&path, &self.cif)?;
        Ok(path)
    }
}

/// Strips a trailing standard uncertainty, e.g. `10.2345(3)`.
fn parse_cif_number(raw: &str) -> Option<f64> {
    let cleaned = raw.split('(').next()?;
    cleaned.parse().ok()
}

fn count_atom_sites(text: &str) -> usize {
    let mut count = 0;
    let mut in_loop = false;
    let mut site_loop = false;
    let mut reading_rows = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "loop_" {
            in_loop = true;
            site_loop = false;
            reading_rows = false;
            continue;
        }
        if line.starts_with('_') {
            if reading_rows {
                in_loop = false;
                site_loop = false;
                reading_rows = false;
            }
            if in_loop && (line.starts_with("_atom_site_fract_") || line.starts_with("_atom_site_label")) {
                site_loop = true;
            }
            continue;
        }
        if line.starts_with("data_") {
            in_loop = false;
            site_loop = false;
            reading_rows = false;
            continue;
        }
        if in_loop {
            reading_rows = true;
            if site_loop {
                count += 1;
            }
        }
    }
    count
}

/// What a caller may hand to a pipeline maker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StructureSource {
    Structure(Structure),
    Path(PathBuf),
}

impl StructureSource {
    /// Resolves to an in-memory structure, failing before anything is scheduled.
    pub fn load(self) -> Result<Structure, FlowError> {
        match self {
            StructureSource::Structure(s) => Ok(s),
            StructureSource::Path(p) => Structure::from_file(p),
        }
    }
}

impl From<Structure> for StructureSource {
    fn from(s: Structure) -> Self {
        StructureSource::Structure(s)
    }
}

impl From<PathBuf> for StructureSource {
    fn from(p: PathBuf) -> Self {
        StructureSource::Path(p)
    }
}

impl From<&Path> for StructureSource {
    fn from(p: &Path) -> Self {
        StructureSource::Path(p.to_path_buf())
    }
}
