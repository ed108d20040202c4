//! Loads stored faces into memory as RGB arrays.
//!
//! Nothing is learned yet; the arrays are the raw material a recognizer
//! would compute encodings from.

use facetranscript_store::{StoreError, UserRecords};
use image::ImageError;
use ndarray::{Array3, ShapeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored image for user {user:?} cannot be decoded: {source}")]
    Decode { user: String, source: ImageError },
    #[error("decoded image has unexpected layout: {0}")]
    Shape(#[from] ShapeError),
}

/// Parallel lists of user names and their decoded face images.
#[derive(Debug, Default)]
pub struct FaceTrainer {
    known_face_names: Vec<String>,
    known_face_encodings: Vec<Array3<u8>>,
}

impl FaceTrainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the lists with every stored user's face.
    ///
    /// Returns the number of faces loaded. On error the lists are left empty.
    pub fn transform_all_faces<R: UserRecords + ?Sized>(
        &mut self,
        records: &R,
    ) -> Result<usize, TrainerError> {
        self.refresh();

        let mut names = Vec::new();
        let mut encodings = Vec::new();
        for record in records.all_users()? {
            let array = decode_rgb(&record.user_name, &record.user_image)?;
            tracing::debug!(user = %record.user_name, shape = ?array.shape(), "face loaded");
            names.push(record.user_name);
            encodings.push(array);
        }

        self.known_face_names = names;
        self.known_face_encodings = encodings;
        tracing::info!(faces = self.len(), "faces loaded");
        Ok(self.len())
    }

    /// Forget everything loaded so far.
    pub fn refresh(&mut self) {
        self.known_face_names.clear();
        self.known_face_encodings.clear();
    }

    pub fn len(&self) -> usize {
        self.known_face_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known_face_names.is_empty()
    }

    pub fn known_face_names(&self) -> &[String] {
        &self.known_face_names
    }

    pub fn known_face_encodings(&self) -> &[Array3<u8>] {
        &self.known_face_encodings
    }

    /// `(name, image)` pairs in storage order.
    pub fn known_faces(&self) -> impl Iterator<Item = (&str, &Array3<u8>)> {
        self.known_face_names
            .iter()
            .map(String::as_str)
            .zip(self.known_face_encodings.iter())
    }
}

/// Decode `user`'s encoded image into a `(height, width, 3)` RGB array.
fn decode_rgb(user: &str, bytes: &[u8]) -> Result<Array3<u8>, TrainerError> {
    let rgb = image::load_from_memory(bytes)
        .map_err(|source| {
            tracing::error!(user, error = %source, "undecodable face image");
            TrainerError::Decode {
                user: user.to_string(),
                source,
            }
        })?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        rgb.into_raw(),
    )?)
}
