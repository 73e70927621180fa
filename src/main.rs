#[macro_use] extern crate rocket;

use std::path::PathBuf;
use std::sync::Arc;
use chrono::NaiveDate;
use log::{error, info};
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::{Build, Rocket};
use rocket_dyn_templates::{handlebars, Template};
use rocket_dyn_templates::handlebars::{Handlebars, Helper};
use serde::{Deserialize, Serialize};
use crate::assign::AssignConfig;
use crate::batch::Engine;
use crate::classify::WeightPolicyKind;
use crate::detect::DetectConfig;
use crate::render::RenderConfig;

mod assets;
mod assign;
mod batch;
mod brackets;
mod category;
mod classify;
mod detect;
mod export;
mod fonts;
mod hough;
mod pages;
mod render;
mod roster;
mod util;

/// Application settings, read from `Rocket.toml` and `ROCKET_*` variables.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AppConfig {
    /// JSON or YAML category table, the built-in table when not set.
    pub categories_file: Option<PathBuf>,
    /// Bracket templates named `<participants>.png`.
    pub bracket_dir: PathBuf,
    /// Every batch writes into its own directory here.
    pub results_dir: PathBuf,
    pub weight_policy: WeightPolicyKind,
    /// Day ages are computed at, today when not set.
    pub reference_date: Option<NaiveDate>,
    /// Shuffles each group with this seed before slots are bound.
    pub draw_seed: Option<u64>,
    pub detect: DetectConfig,
    pub assign: AssignConfig,
    pub render: RenderConfig,
    /// Also stack the brackets two per A4 page.
    pub pages: bool,
}
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            categories_file: None,
            bracket_dir: PathBuf::from("bracket_templates"),
            results_dir: PathBuf::from("results"),
            weight_policy: WeightPolicyKind::default(),
            reference_date: None,
            draw_seed: None,
            detect: DetectConfig::default(),
            assign: AssignConfig::default(),
            render: RenderConfig::default(),
            pages: true,
        }
    }
}

fn setup_engine(rocket: &Rocket<Build>) -> anyhow::Result<(AppConfig, Engine)> {
    let cfg = rocket.figment().extract::<AppConfig>()?;
    let engine = Engine::from_config(&cfg)?;
    info!("Category table: {} age bands, weight policy {:?}, templates in {}, results in {}",
        engine.table.bands.len(), cfg.weight_policy, cfg.bracket_dir.to_string_lossy(), cfg.results_dir.to_string_lossy());
    Ok((cfg, engine))
}

pub(crate) fn build_rocket(figment: Figment) -> Rocket<Build> {
    let rocket = rocket::custom(figment)
        .attach(Template::custom(|engines| {
            let handlebars = &mut engines.handlebars;
            handlebars.register_helper("stringify",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let param = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("stringify", 0))?;
                                           let json = serde_json::to_string_pretty(param.value()).unwrap_or_else(|_| "Invalid JSON".to_string());
                                           out.write(json.as_ref())?;
                                           Ok(())
                                       }));
        }))
        .attach(AdHoc::try_on_ignite("Bracket engine", |rocket| async move {
            match setup_engine(&rocket) {
                Ok((cfg, engine)) => Ok(rocket.manage(cfg).manage(Arc::new(engine))),
                Err(e) => {
                    error!("Invalid configuration: {e:#}");
                    Err(rocket)
                }
            }
        }));
    brackets::extend(rocket)
}

#[launch]
fn rocket() -> _ {
    build_rocket(rocket::Config::figment())
}
