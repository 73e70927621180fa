use std::path::{Path, PathBuf};
use std::sync::Arc;
use base64::engine::general_purpose;
use base64::Engine as _;
use chrono::Local;
use image::imageops::FilterType;
use image::ImageFormat;
use log::{info, warn};
use rocket::data::ToByteUnit;
use rocket::form::Form;
use rocket::fs::{NamedFile, TempFile};
use rocket::http::{ContentType, Status};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::tokio::io::AsyncReadExt;
use rocket::{Build, Data, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use crate::batch::{BatchReport, Engine};
use crate::roster::{parse_roster, Participant};
use crate::util::{anyhow_to_custom_error, generate_random_string, string_to_custom_error, unzip_data};
use crate::AppConfig;

pub type SharedEngine = Arc<Engine>;

const THUMBNAIL_WIDTH: u32 = 480;

#[derive(Serialize, serde::Deserialize, Debug)]
pub struct Health {
    pub status: String,
    pub bracket_dir: String,
    pub templates: Vec<usize>,
    pub categories: Vec<String>,
}

#[get("/api/health")]
fn get_health(engine: &State<SharedEngine>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        bracket_dir: engine.assets.dir().to_string_lossy().to_string(),
        templates: engine.assets.available(),
        categories: engine.table.bands.iter().map(|b| b.label.clone()).collect(),
    })
}

fn new_batch_id() -> String {
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), generate_random_string(6))
}

fn is_batch_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

const API_SOURCE: &str = "roster";

fn read_roster(data: &[u8], source: &str, engine: &Engine) -> Result<Vec<Participant>, Custom<String>> {
    if data.is_empty() {
        return Err(string_to_custom_error(format!("Empty roster {source}")));
    }
    parse_roster(data, source, engine.reference_date())
        .map_err(|e| string_to_custom_error(format!("{e:#}")))
}

async fn run_batch(participants: Vec<Participant>, engine: &State<SharedEngine>, cfg: &State<AppConfig>) -> Result<BatchReport, Custom<String>> {
    let batch_id = new_batch_id();
    let out_dir = cfg.results_dir.join(&batch_id);
    info!("Batch {batch_id}: {} roster rows, output {}", participants.len(), out_dir.to_string_lossy());
    let engine = engine.inner().clone();
    rocket::tokio::task::spawn_blocking(move || engine.run(&batch_id, &participants, &out_dir))
        .await
        .map_err(|e| anyhow_to_custom_error(e.into()))?
        .map_err(anyhow_to_custom_error)
}

#[post("/api/generate-brackets", data = "<data>")]
async fn post_generate_brackets(data: Data<'_>, content_type: &ContentType, engine: &State<SharedEngine>, cfg: &State<AppConfig>) -> Result<Json<BatchReport>, Custom<String>> {
    let data = data.open(50.mebibytes()).into_bytes().await.map_err(|e| Custom(Status::PayloadTooLarge, e.to_string()))?.into_inner();
    let data = if content_type == &ContentType::ZIP {
        unzip_data(&data).map_err(|e| Custom(Status::UnprocessableEntity, e.to_string()))?
    } else {
        data
    };
    let participants = read_roster(&data, API_SOURCE, engine)?;
    run_batch(participants, engine, cfg).await.map(Json)
}

#[get("/api/download/<batch>/<path..>")]
async fn get_download(batch: &str, path: PathBuf, cfg: &State<AppConfig>) -> Result<NamedFile, Custom<String>> {
    if !is_batch_id(batch) {
        return Err(Custom(Status::BadRequest, format!("Invalid batch id: {batch}")));
    }
    let file = cfg.results_dir.join(batch).join(&path);
    NamedFile::open(&file).await
        .map_err(|_| Custom(Status::NotFound, format!("{batch}/{} not found", path.to_string_lossy())))
}

#[get("/")]
fn index(engine: &State<SharedEngine>) -> Template {
    Template::render("index", context! {
        templates: engine.assets.available(),
        categories: engine.table.bands.iter().map(|b| b.label.clone()).collect::<Vec<_>>(),
    })
}

#[derive(FromForm)]
struct RosterUpload<'r> {
    /// Every file is one roster, their participants are drawn together.
    roster: Vec<TempFile<'r>>,
}

#[derive(Serialize)]
struct Thumbnail {
    label: String,
    href: String,
    data: String,
}

fn thumbnail(path: &Path) -> anyhow::Result<String> {
    let img = image::open(path)?;
    let img = if img.width() > THUMBNAIL_WIDTH {
        img.resize(THUMBNAIL_WIDTH, u32::MAX, FilterType::Triangle)
    } else {
        img
    };
    let mut buffer = Vec::new();
    img.to_rgb8().write_to(&mut std::io::Cursor::new(&mut buffer), ImageFormat::Jpeg)?;
    Ok(general_purpose::STANDARD.encode(&buffer))
}

#[post("/generate", data = "<form>")]
async fn post_generate(form: Form<RosterUpload<'_>>, engine: &State<SharedEngine>, cfg: &State<AppConfig>) -> Result<Template, Custom<String>> {
    if form.roster.is_empty() {
        return Err(string_to_custom_error("No roster uploaded"));
    }
    let mut participants = Vec::new();
    for (ix, file) in form.roster.iter().enumerate() {
        let source = file.name().map(str::to_string).unwrap_or_else(|| format!("roster-{}", ix + 1));
        let mut data = Vec::new();
        let reader = file.open().await
            .map_err(|e| string_to_custom_error(format!("Cannot read upload {source}: {e}")))?;
        rocket::tokio::pin!(reader);
        reader.read_to_end(&mut data).await
            .map_err(|e| string_to_custom_error(format!("Cannot read upload {source}: {e}")))?;
        participants.extend(read_roster(&data, &source, engine)?);
    }
    let report = run_batch(participants, engine, cfg).await?;
    let out_dir = cfg.results_dir.join(&report.batch_id);
    let thumbnails = report.categories.iter()
        .filter_map(|c| c.bracket.as_ref().map(|b| (c, b)))
        .filter_map(|(c, b)| match thumbnail(&out_dir.join(b)) {
            Ok(data) => Some(Thumbnail {
                label: c.label.clone(),
                href: format!("/api/download/{}/{b}", report.batch_id),
                data,
            }),
            Err(e) => {
                warn!("Thumbnail of {b} failed: {e:#}");
                None
            }
        })
        .collect::<Vec<_>>();
    Ok(Template::render("results", context! {
        report,
        thumbnails,
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            index,
            get_health,
            post_generate_brackets,
            get_download,
            post_generate,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_ids_are_path_safe() {
        let id = new_batch_id();
        assert!(is_batch_id(&id), "{id}");
        assert!(!is_batch_id(".."));
        assert!(!is_batch_id("a/b"));
        assert!(!is_batch_id(""));
    }
}
