use crate::config::Config;
use facetranscript_core::{CaptureError, CaptureFace, CaptureOutcome, CascadeError, FaceDetector};
use facetranscript_hw::{Camera, CameraError, FrameSource};
use facetranscript_store::{StoreError, UserDatabase, UserRecord, UserRecords};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceDatabaseError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("cascade error: {0}")]
    Cascade(#[from] CascadeError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ties capture and persistence together: capture a face for a user and
/// store it under their name.
pub struct FaceDatabase {
    config: Config,
    store: UserDatabase,
    capture: CaptureFace,
}

impl FaceDatabase {
    /// Open the database, make sure the user table exists, and load the
    /// cascade. Fails fast if either is unusable.
    pub fn new(config: Config) -> Result<Self, FaceDatabaseError> {
        let store = open_user_database(&config)?;

        let detector = FaceDetector::load(&config.cascade_path, config.detector_params())?;
        tracing::info!(
            path = %config.cascade_path.display(),
            stages = detector.cascade().stage_count(),
            "cascade loaded"
        );

        let capture = CaptureFace::new(detector, config.capture_settings());
        Ok(Self {
            config,
            store,
            capture,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &UserDatabase {
        &self.store
    }

    pub fn capture(&self) -> &CaptureFace {
        &self.capture
    }

    /// Capture from the configured camera and store the face for `user_name`.
    ///
    /// The camera is held only for the duration of the call. The first
    /// `warmup_frames` frames are discarded while exposure settles.
    pub fn take_photo(
        &self,
        user_name: &str,
        cancel: &AtomicBool,
    ) -> Result<CaptureOutcome, FaceDatabaseError> {
        let mut camera = Camera::open(
            &self.config.camera_device,
            self.config.camera_width,
            self.config.camera_height,
        )?;
        camera.set_frame_timeout(self.config.frame_timeout());
        tracing::info!(
            device = %camera.device_path,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        self.take_photo_warmed(user_name, &mut camera, cancel)
    }

    fn take_photo_warmed<S: FrameSource + ?Sized>(
        &self,
        user_name: &str,
        source: &mut S,
        cancel: &AtomicBool,
    ) -> Result<CaptureOutcome, FaceDatabaseError> {
        let warmup = self.config.warmup_frames;
        if warmup > 0 {
            tracing::info!(count = warmup, "discarding warmup frames");
            source.skip_frames(warmup)?;
        }
        self.take_photo_from(user_name, source, cancel)
    }

    /// Like [`take_photo`](Self::take_photo), with a caller-supplied source.
    ///
    /// Nothing is stored unless a face was captured.
    pub fn take_photo_from<S: FrameSource + ?Sized>(
        &self,
        user_name: &str,
        source: &mut S,
        cancel: &AtomicBool,
    ) -> Result<CaptureOutcome, FaceDatabaseError> {
        let outcome = self.capture.capture_image(source, user_name, cancel)?;
        if let Some(face) = outcome.captured() {
            self.store.insert_user_image(user_name, &face.jpeg)?;
        }
        Ok(outcome)
    }

    /// Store an existing image file as-is.
    pub fn import_image(
        &self,
        user_name: &str,
        image_path: impl AsRef<Path>,
    ) -> Result<(), FaceDatabaseError> {
        Ok(self.store.insert_user_image_file(user_name, image_path)?)
    }

    pub fn get_all_users(&self) -> Result<Vec<UserRecord>, FaceDatabaseError> {
        Ok(self.store.all_users()?)
    }

    pub fn get_user(&self, user_name: &str) -> Result<Option<UserRecord>, FaceDatabaseError> {
        Ok(self.store.get_user(user_name)?)
    }

    pub fn delete_user(&self, user_name: &str) -> Result<bool, FaceDatabaseError> {
        Ok(self.store.delete_user(user_name)?)
    }

    pub fn drop_table(&self) -> Result<(), FaceDatabaseError> {
        Ok(self.store.drop_table()?)
    }

    pub fn close(self) -> Result<(), FaceDatabaseError> {
        Ok(self.store.close()?)
    }
}

/// Open the configured database and make sure the user table exists.
///
/// For work that never captures, so no cascade is needed.
pub fn open_user_database(config: &Config) -> Result<UserDatabase, StoreError> {
    let store = UserDatabase::open(&config.database_path, config.table()?)?;
    store.create_user_table()?;
    Ok(store)
}

impl UserRecords for FaceDatabase {
    fn all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.store.all_users()
    }
}
