use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    data_dir::write_atomically,
    error::{Error, Result},
    provider::FaceEncoder,
    vector_db::cosine_similarity,
};

/// An image matches a person when any of its faces is more similar than
/// this to the reference descriptor.
pub const FACE_MATCH_THRESHOLD: f32 = 0.6;

/// Extensions accepted for reference faces and match candidates.
pub const FACE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    faces: BTreeMap<String, Vec<f32>>,
}

/// Known people: lowercased name -> reference face descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceGallery {
    faces: BTreeMap<String, Vec<f32>>,
}

impl FaceGallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a saved gallery; [`Error::NotFound`] if it was never written.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    kind: "face gallery",
                    name: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != FORMAT_VERSION {
            return Err(Error::Format {
                kind: "face gallery",
                reason: format!("unsupported version {}", snapshot.version),
            });
        }
        Ok(Self {
            faces: snapshot.faces,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            version: FORMAT_VERSION,
            faces: self.faces.clone(),
        };
        write_atomically(path, &serde_json::to_vec(&snapshot)?)?;
        info!(faces = self.len(), file = %path.display(), "face gallery saved");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Known names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.faces.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.faces.get(&normalize_name(name)).map(Vec::as_slice)
    }

    /// Store a descriptor under the normalized `name`, replacing any
    /// previous one.
    pub fn insert(&mut self, name: &str, descriptor: Vec<f32>) {
        self.faces.insert(normalize_name(name), descriptor);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.faces.remove(&normalize_name(name)).is_some()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn has_face_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            FACE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known))
        })
}

/// Build a gallery from the labeled reference images in `face_dir`.
///
/// Each `png`/`jpg`/`jpeg` file directly inside the directory contributes
/// its first face under its lowercased file stem. Files without a
/// detectable face, or whose extraction fails, are skipped.
pub fn encode_faces(
    face_dir: &Path,
    encoder: &dyn FaceEncoder,
) -> Result<FaceGallery> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(face_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_face_extension(path))
        .collect();
    files.sort();

    let mut gallery = FaceGallery::new();
    for path in files {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match encoder.face_descriptors(&path) {
            Ok(descriptors) => match descriptors.into_iter().next() {
                Some(primary) => {
                    debug!(name, "encoded reference face");
                    gallery.insert(name, primary);
                }
                None => {
                    warn!(path = %path.display(), "no face found in reference image");
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not encode reference face");
            }
        }
    }

    info!(faces = gallery.len(), dir = %face_dir.display(), "face gallery built");
    Ok(gallery)
}

/// Images among `candidates` that contain the person called `name`.
///
/// Returns an empty list when the name is not in the gallery. Candidates
/// keep their input order; an image is accepted on its first face above
/// [`FACE_MATCH_THRESHOLD`] and the rest of its faces are not compared.
/// Images whose faces cannot be extracted are skipped.
pub fn search_face_by_name(
    name: &str,
    gallery: &FaceGallery,
    candidates: &[String],
    encoder: &dyn FaceEncoder,
) -> Vec<String> {
    let Some(reference) = gallery.get(name) else {
        warn!(name = %normalize_name(name), "face not found in gallery");
        return Vec::new();
    };

    let mut matches = Vec::new();
    for candidate in candidates {
        let path = Path::new(candidate);
        if !has_face_extension(path) {
            continue;
        }
        let descriptors = match encoder.face_descriptors(path) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                debug!(path = %candidate, error = %e, "skipping image");
                continue;
            }
        };
        let matched = descriptors.iter().find_map(|descriptor| {
            let similarity = cosine_similarity(reference, descriptor);
            (similarity > FACE_MATCH_THRESHOLD).then_some(similarity)
        });
        if let Some(similarity) = matched {
            debug!(path = %candidate, similarity, "face match");
            matches.push(candidate.clone());
        }
    }
    matches
}
