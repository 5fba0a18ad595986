//! Orchestration of the mutating endpoints.
//!
//! Each request moves through the same stages: the digest is checked against the raw
//! body, the body is parsed and validated, business rules are checked against the
//! metadata store, and only then are records and images written.
//!
//! Writes are not transactional across the two stores. Images are staged first and
//! published only after the metadata row referencing them has been committed, so a
//! failing metadata write never leaves a stray file behind. A failed publish after a
//! committed row, and images already stored for earlier entries of a failed report,
//! are left as they are.

use std::{io, path::PathBuf};

use actix_web::web;
use log::{error, info, warn};

use crate::{
    db::{DbBackend, DbError},
    digest::DigestVerifier,
    error::{ApiError, Conflict},
    images::{ImageError, ImageRole, ImageStore, StagedImage},
    models::{Agent, AgentChanges, Report, ReportImage},
    requests::{
        parse_body, AgentImageRequest, ImageSubmission, RegisterAgentRequest,
        SubmitReportRequest,
    },
    util,
};

/// Attempts at finding an unused report id before giving up
pub const MAX_REPORT_ID_ATTEMPTS: usize = 8;

async fn blocking<T, F>(f: F) -> Result<T, ImageError>
where
    F: FnOnce() -> Result<T, ImageError> + Send + 'static,
    T: Send + 'static,
{
    web::block(f).await.map_err(|_| {
        ImageError::Io(io::Error::new(
            io::ErrorKind::Interrupted,
            "image task was cancelled",
        ))
    })?
}

/// Handles agent registration, agent pictures and report submission
#[derive(Debug)]
pub struct Ingestion<'a, D: DbBackend> {
    db: &'a D,
    images: &'a ImageStore,
    verifier: &'a DigestVerifier,
}

impl<'a, D: DbBackend> Ingestion<'a, D> {
    /// Create the service over its collaborators
    pub fn new(db: &'a D, images: &'a ImageStore, verifier: &'a DigestVerifier) -> Self {
        Self {
            db,
            images,
            verifier,
        }
    }

    fn authenticate(&self, body: &[u8], digest: Option<&str>) -> Result<(), ApiError> {
        match digest {
            Some(d) if self.verifier.verify(body, d) => Ok(()),
            _ => {
                warn!("failed HMAC auth");
                Err(ApiError::Auth)
            }
        }
    }

    /// Register a new agent from a raw `POST /api/agents` body
    pub async fn register_agent(&self, body: &[u8], digest: Option<&str>) -> Result<Agent, ApiError> {
        self.authenticate(body, digest)?;
        let new = parse_body::<RegisterAgentRequest>(body)?.validate()?;

        if self.db.get_agent(&new.id).await?.is_some() {
            return Err(Conflict::AgentExists(new.id).into());
        }

        let agent = Agent {
            id: new.id,
            name: new.name,
            location: new.location,
            secret: new.secret,
            online: util::now(),
            description: new.description,
            picture: None,
        };
        match self.db.add_agent(agent.clone()).await {
            Ok(()) => {}
            // registered by a concurrent request since the existence check
            Err(DbError::Constraint(_)) => return Err(Conflict::AgentExists(agent.id).into()),
            Err(e) => return Err(e.into()),
        }

        info!("registered agent {}", agent.id);
        Ok(agent)
    }

    /// Store a new picture for an agent from a raw `POST /api/agents/image` body.
    ///
    /// Returns the path of the picture relative to the data directory.
    pub async fn upload_agent_image(
        &self,
        body: &[u8],
        digest: Option<&str>,
    ) -> Result<PathBuf, ApiError> {
        self.authenticate(body, digest)?;
        let upload = parse_body::<AgentImageRequest>(body)?.validate()?;

        if self.db.get_agent(&upload.id).await?.is_none() {
            return Err(Conflict::UnknownAgent(upload.id).into());
        }

        let store = self.images.clone();
        let name = upload.id.clone();
        let staged =
            blocking(move || store.stage(&name, &upload.image, ImageRole::Agent)).await?;

        let changes = AgentChanges {
            picture: Some(staged.relative_path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        if !self.db.update_agent(&upload.id, changes).await? {
            return Err(Conflict::UnknownAgent(upload.id).into());
        }

        let path = staged.publish().map_err(|e| {
            error!(
                "agent {} now references a picture that failed to publish: {}",
                upload.id, e
            );
            e
        })?;
        info!("stored picture {:?} for agent {}", path, upload.id);
        Ok(path)
    }

    /// Record a report and its images from a raw `POST /api/reports` body.
    ///
    /// Images are processed in order. The first image that fails aborts the request,
    /// images after it are never attempted and images before it are kept.
    pub async fn submit_report(&self, body: &[u8], digest: Option<&str>) -> Result<Report, ApiError> {
        self.authenticate(body, digest)?;
        let submission = parse_body::<SubmitReportRequest>(body)?.validate()?;

        let agent = match self.db.get_agent(&submission.agent).await? {
            Some(a) => a,
            None => return Err(Conflict::UnknownAgent(submission.agent).into()),
        };

        let id = self
            .unused_report_id(|| util::generate_report_id(submission.time, &agent.id))
            .await?;
        let report = Report {
            id,
            time: submission.time,
            location: agent.location,
            agent: agent.id,
        };
        self.db.add_report(report.clone()).await?;
        info!("recorded report {} for agent {}", report.id, report.agent);

        let total = submission.images.len();
        for (i, entry) in submission.images.into_iter().enumerate() {
            if let Err(e) = self.store_report_image(&report.id, entry).await {
                error!(
                    "image {} of {} for report {} failed, keeping the {} stored before it: {}",
                    i + 1,
                    total,
                    report.id,
                    i,
                    e
                );
                return Err(e);
            }
        }

        Ok(report)
    }

    /// Find a report id that is not taken yet, drawing candidates from `generate`
    async fn unused_report_id(
        &self,
        mut generate: impl FnMut() -> String,
    ) -> Result<String, ApiError> {
        for _ in 0..MAX_REPORT_ID_ATTEMPTS {
            let id = generate();
            if self.db.get_report(&id).await?.is_none() {
                return Ok(id);
            }
            warn!("generated report id {} is taken, regenerating", id);
        }
        Err(DbError::Constraint(String::from("no unused report id could be generated")).into())
    }

    async fn store_report_image(
        &self,
        report_id: &str,
        entry: ImageSubmission,
    ) -> Result<ReportImage, ApiError> {
        let ImageSubmission {
            image,
            location,
            file_name,
        } = entry;
        let image_id = format!("{}_{}", report_id, file_name);

        let store = self.images.clone();
        let name = image_id.clone();
        let (full, thumb): (StagedImage, StagedImage) = blocking(move || {
            let decoded = store.decode(&image)?;
            let full = store.stage_decoded(&name, &decoded, ImageRole::Report)?;
            let thumb = store.stage_decoded(&name, &decoded, ImageRole::ReportThumb)?;
            Ok((full, thumb))
        })
        .await?;

        let row = ReportImage {
            id: image_id,
            path: full.relative_path().to_string_lossy().into_owned(),
            location,
            confirmed: false,
            report: report_id.to_string(),
        };
        self.db.add_report_image(row.clone()).await?;

        full.publish()?;
        thumb.publish()?;
        Ok(row)
    }
}

#[cfg(test)]
#[cfg(not(tarpaulin_include))]
mod test {
    use std::path::Path;

    use base64::{engine::general_purpose, Engine as _};
    use image::ImageFormat;
    use serde_json::json;

    use super::Ingestion;
    use crate::{
        db::{
            tests::{agent, MockDb},
            DbBackend, DbError,
        },
        digest::DigestVerifier,
        error::{ApiError, Conflict},
        images::{test::png_payload, ImageError, ImageStore},
        models::{AgentChanges, Report},
        requests::Problem,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        db: MockDb,
        images: ImageStore,
        verifier: DigestVerifier,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let images = ImageStore::new(dir.path().join("data"), ImageFormat::Png);
            images.init().unwrap();
            Self {
                _dir: dir,
                db: MockDb::new(),
                images,
                verifier: DigestVerifier::new("password"),
            }
        }

        fn service(&self) -> Ingestion<'_, MockDb> {
            Ingestion::new(&self.db, &self.images, &self.verifier)
        }

        fn signed(&self, body: &serde_json::Value) -> (Vec<u8>, String) {
            let body = serde_json::to_vec(body).unwrap();
            let digest = self.verifier.sign(&body);
            (body, digest)
        }

        fn files(&self, dir: &str) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.images.root().join(dir))
                .unwrap()
                .map(|e| e.unwrap())
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        async fn register(&self, id: &str, location: &str) {
            let (body, digest) = self.signed(&json!({
                "id": id, "name": "A", "location": location, "secret": "s"
            }));
            self.service()
                .register_agent(&body, Some(&digest))
                .await
                .unwrap();
        }

        async fn submit(&self, body: serde_json::Value) -> Result<Report, ApiError> {
            let (body, digest) = self.signed(&body);
            self.service().submit_report(&body, Some(&digest)).await
        }
    }

    #[actix_web::test]
    async fn test_register_agent() {
        let f = Fixture::new();
        let (body, digest) = f.signed(&json!({
            "id": "a1", "name": "A", "location": "NY", "secret": "s"
        }));
        let before = crate::util::now();
        let created = f.service().register_agent(&body, Some(&digest)).await.unwrap();

        let stored = f.db.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(stored, created);
        assert_eq!(stored.name, "A");
        assert_eq!(stored.location, "NY");
        assert_eq!(stored.secret, "s");
        assert_eq!(stored.picture, None);
        assert!(stored.online >= before);
    }

    #[actix_web::test]
    async fn test_duplicate_registration_rejected() {
        let f = Fixture::new();
        f.register("a1", "NY").await;
        let original = f.db.get_agent("a1").await.unwrap().unwrap();

        let (body, digest) = f.signed(&json!({
            "id": " a1 ", "name": "B", "location": "LA", "secret": "other"
        }));
        let err = f
            .service()
            .register_agent(&body, Some(&digest))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ApiError::Conflict(Conflict::AgentExists(ref id)) if id == "a1"),
            "{:?}",
            err
        );
        assert_eq!(f.db.get_agent("a1").await.unwrap().unwrap(), original);
    }

    #[actix_web::test]
    async fn test_digest_checked_first() {
        let f = Fixture::new();
        let body = serde_json::to_vec(&json!({
            "id": "a1", "name": "A", "location": "NY", "secret": "s"
        }))
        .unwrap();

        let err = f.service().register_agent(&body, None).await.unwrap_err();
        assert!(matches!(err, ApiError::Auth));

        let wrong = DigestVerifier::new("not the secret").sign(&body);
        let err = f
            .service()
            .register_agent(&body, Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth));

        // invalid bodies are still rejected as unauthenticated first
        let err = f
            .service()
            .submit_report(b"{broken", Some("00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth));

        assert!(f.db.list_agents().await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_oversized_fields_rejected_before_writes() {
        let f = Fixture::new();
        let (body, digest) = f.signed(&json!({
            "id": "x".repeat(51), "name": "A", "location": "NY", "secret": "s".repeat(257)
        }));
        let err = f
            .service()
            .register_agent(&body, Some(&digest))
            .await
            .unwrap_err();
        match err {
            ApiError::Validation(v) => {
                assert_eq!(v.fields(), ["id", "secret"]);
                assert!(v
                    .problems
                    .iter()
                    .all(|p| matches!(p.problem, Problem::TooLong { .. })));
            }
            e => panic!("expected validation error, got {:?}", e),
        }
        assert!(f.db.list_agents().await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_agent_image_for_unknown_agent() {
        let f = Fixture::new();
        let (body, digest) = f.signed(&json!({"id": "ghost", "image": png_payload(10, 10)}));
        let err = f
            .service()
            .upload_agent_image(&body, Some(&digest))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(Conflict::UnknownAgent(_))));
        assert!(f.files("images/agent").is_empty());
        assert!(f.db.list_agents().await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_agent_image_stored_and_referenced() {
        let f = Fixture::new();
        f.register("a1", "NY").await;

        let (body, digest) = f.signed(&json!({"id": "a1", "image": png_payload(800, 400)}));
        let path = f
            .service()
            .upload_agent_image(&body, Some(&digest))
            .await
            .unwrap();
        assert_eq!(path, Path::new("images/agent/a1.png"));

        let agent = f.db.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.picture.as_deref(), Some("images/agent/a1.png"));
        assert_eq!(agent.location, "NY");
        assert_eq!(f.files("images/agent"), ["a1.png"]);

        let img = image::load_from_memory(&f.images.open(&path).unwrap()).unwrap();
        assert_eq!((img.width(), img.height()), (500, 250));
    }

    #[actix_web::test]
    async fn test_agent_image_metadata_failure_leaves_no_file() {
        let f = Fixture::new();
        f.register("a1", "NY").await;
        f.db.fail_agent_updates();

        let (body, digest) = f.signed(&json!({"id": "a1", "image": png_payload(10, 10)}));
        let err = f
            .service()
            .upload_agent_image(&body, Some(&digest))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Storage(_)), "{:?}", err);
        assert!(f.files("images/agent").is_empty());
        assert_eq!(f.db.get_agent("a1").await.unwrap().unwrap().picture, None);
    }

    #[actix_web::test]
    async fn test_agent_image_bad_payload() {
        let f = Fixture::new();
        f.register("a1", "NY").await;

        let (body, digest) = f.signed(&json!({"id": "a1", "image": "%%%"}));
        let err = f
            .service()
            .upload_agent_image(&body, Some(&digest))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Image(ImageError::Decode(_))), "{:?}", err);

        let text = general_purpose::STANDARD.encode("hello");
        let (body, digest) = f.signed(&json!({"id": "a1", "image": text}));
        let err = f
            .service()
            .upload_agent_image(&body, Some(&digest))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Image(ImageError::Format(_))), "{:?}", err);

        assert!(f.files("images/agent").is_empty());
    }

    #[actix_web::test]
    async fn test_report_location_captured_at_submission() {
        let f = Fixture::new();
        f.register("a1", "NY").await;

        let report = f
            .submit(json!({"agent": "a1", "time": 1_700_000_000}))
            .await
            .unwrap();
        assert_eq!(report.location, "NY");

        f.db.update_agent(
            "a1",
            AgentChanges {
                location: Some("LA".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let stored = f.db.get_report(&report.id).await.unwrap().unwrap();
        assert_eq!(stored.location, "NY");
        assert_eq!(stored.time, 1_700_000_000);
        assert_eq!(stored.agent, "a1");
        assert_eq!(f.db.report_count(), 1);
    }

    #[actix_web::test]
    async fn test_report_unknown_agent() {
        let f = Fixture::new();
        let err = f
            .submit(json!({"agent": "ghost", "time": 1, "images": [
                {"image": png_payload(4, 4), "location": "gate"}
            ]}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(Conflict::UnknownAgent(_))));
        assert_eq!(f.db.report_count(), 0);
        assert!(f.files("images/reports").is_empty());
    }

    #[actix_web::test]
    async fn test_report_with_images() {
        let f = Fixture::new();
        f.register("a1", "NY").await;

        let report = f
            .submit(json!({"agent": "a1", "time": 10, "images": [
                {"image": png_payload(3000, 1000), "location": "gate"},
                {"image": png_payload(40, 30), "location": "roof"},
                {"image": png_payload(600, 600), "location": "yard"},
            ]}))
            .await
            .unwrap();

        let rows = f.db.list_report_images(&report.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.id, format!("{}_{}", report.id, row.location));
            assert_eq!(row.path, format!("images/reports/{}.png", row.id));
            assert!(!row.confirmed);
        }

        let files = f.files("images/reports");
        assert_eq!(files.len(), 3);
        assert!(files.contains(&format!("{}_gate.png", report.id)));
        assert_eq!(f.files("images/reports/thumbs"), files);

        let full = image::load_from_memory(
            &f.images
                .open(Path::new(&format!("images/reports/{}_gate.png", report.id)))
                .unwrap(),
        )
        .unwrap();
        assert_eq!((full.width(), full.height()), (2000, 667));
        let thumb = image::load_from_memory(
            &f.images
                .open(Path::new(&format!("images/reports/thumbs/{}_gate.png", report.id)))
                .unwrap(),
        )
        .unwrap();
        assert_eq!((thumb.width(), thumb.height()), (500, 167));
    }

    #[actix_web::test]
    async fn test_report_image_files_never_shared() {
        let f = Fixture::new();
        f.register("a1", "NY").await;

        // a label ending like a thumbnail gets its own pair of files
        let report = f
            .submit(json!({"agent": "a1", "time": 10, "images": [
                {"image": png_payload(1000, 1000), "location": "gate"},
                {"image": png_payload(30, 20), "location": "gate.thumb"},
            ]}))
            .await
            .unwrap();
        assert_eq!(f.db.list_report_images(&report.id).await.unwrap().len(), 2);
        let expected = [
            format!("{}_gate.png", report.id),
            format!("{}_gate.thumb.png", report.id),
        ];
        assert_eq!(f.files("images/reports"), expected);
        assert_eq!(f.files("images/reports/thumbs"), expected);

        let thumb = image::load_from_memory(
            &f.images
                .open(Path::new(&format!("images/reports/thumbs/{}", expected[0])))
                .unwrap(),
        )
        .unwrap();
        assert_eq!((thumb.width(), thumb.height()), (500, 500));

        // labels that sanitize to the same name are refused before anything is written
        let err = f
            .submit(json!({"agent": "a1", "time": 11, "images": [
                {"image": png_payload(1000, 1000), "location": "a b"},
                {"image": png_payload(30, 20), "location": "a_b"},
            ]}))
            .await
            .unwrap_err();
        match err {
            ApiError::Validation(v) => assert_eq!(v.fields(), ["images[1].location"]),
            e => panic!("expected validation error, got {:?}", e),
        }
        assert_eq!(f.db.report_count(), 1);
        assert_eq!(f.db.image_count(), 2);
        assert_eq!(f.files("images/reports").len(), 2);
    }

    #[actix_web::test]
    async fn test_report_mid_list_image_failure_keeps_earlier_images() {
        let f = Fixture::new();
        f.register("a1", "NY").await;
        let corrupt = general_purpose::STANDARD.encode("definitely not an image");

        let err = f
            .submit(json!({"agent": "a1", "time": 10, "images": [
                {"image": png_payload(20, 20), "location": "gate"},
                {"image": corrupt, "location": "roof"},
                {"image": png_payload(20, 20), "location": "yard"},
            ]}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Image(ImageError::Format(_))), "{:?}", err);

        // the report and the first image stay, nothing for the failing or later images
        let reports = f.db.list_reports(20, 0).await.unwrap();
        assert_eq!(reports.len(), 1);
        let rows = f.db.list_report_images(&reports[0].id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].location, "gate");

        let id = &reports[0].id;
        assert_eq!(f.files("images/reports"), [format!("{}_gate.png", id)]);
        assert_eq!(f.files("images/reports/thumbs"), [format!("{}_gate.png", id)]);
    }

    #[actix_web::test]
    async fn test_report_metadata_failure_keeps_earlier_images() {
        let f = Fixture::new();
        f.register("a1", "NY").await;
        f.db.fail_images_after(1);

        let err = f
            .submit(json!({"agent": "a1", "time": 10, "images": [
                {"image": png_payload(20, 20), "location": "gate"},
                {"image": png_payload(20, 20), "location": "roof"},
                {"image": png_payload(20, 20), "location": "yard"},
            ]}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Storage(_)), "{:?}", err);

        assert_eq!(f.db.image_count(), 1);
        let id = &f.db.list_reports(20, 0).await.unwrap()[0].id;
        assert_eq!(f.files("images/reports"), [format!("{}_gate.png", id)]);
        assert_eq!(f.files("images/reports/thumbs"), [format!("{}_gate.png", id)]);
    }

    #[actix_web::test]
    async fn test_taken_report_ids_regenerated() {
        let f = Fixture::new();
        f.db.add_agent(agent("a1", "NY")).await.unwrap();
        f.db.add_report(Report {
            id: "taken".into(),
            time: 1,
            location: "NY".into(),
            agent: "a1".into(),
        })
        .await
        .unwrap();

        let mut candidates = vec!["fresh", "taken", "taken"];
        let id = f
            .service()
            .unused_report_id(|| candidates.pop().unwrap().to_string())
            .await
            .unwrap();
        assert_eq!(id, "fresh");

        let err = f
            .service()
            .unused_report_id(|| String::from("taken"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Storage(DbError::Constraint(_))));
    }
}
