//! Family and dataset definitions.
//!
//! A *family* is one kind of published extract (daily quotas, FIDC monthly
//! report tabs, fact sheets, ...) with its own file naming and header drift.
//! A *dataset* is a consolidated output the snapshot cache serves lookups from.
//! Both come from a YAML document, or from [`Config::builtin`].

use anyhow::{bail, Context, Result};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::cache::predicate::{MonthFilter, Validity};
use crate::process::{
    ingest::Period,
    latest::GroupScope,
    loader::TableLoader,
    reconcile::SchemaRules,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub families: Vec<FamilyConfig>,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    #[default]
    Monthly,
    Yearly,
}

/// Where a family's source files live, relative to the data root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLayout {
    /// One file per (tab, period). `{tab}`, `{year}` and `{month}` are substituted.
    Template { pattern: String },
    /// Every file in `dir` whose name starts with `prefix`, regardless of period.
    Directory { dir: String, prefix: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    pub source: SourceLayout,
    /// Sub-tables published side by side; `[""]` when the family has one.
    #[serde(default = "default_tabs")]
    pub tabs: Vec<String>,
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default = "default_source_delimiter")]
    pub delimiter: char,
    /// WHATWG label, e.g. `latin1`, `utf-8`.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub schema: SchemaRules,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub output_dir: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    /// Also write a latest-per-group snapshot next to the consolidated file.
    #[serde(default)]
    pub latest: Option<GroupScope>,
    #[serde(default)]
    pub parquet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    /// Glob patterns relative to the data root.
    pub sources: Vec<String>,
    #[serde(default = "default_output_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default)]
    pub month_filter: MonthFilter,
    /// Checked only for latest lookups.
    #[serde(default)]
    pub validity: Vec<Validity>,
}

fn default_tabs() -> Vec<String> {
    vec![String::new()]
}
fn default_source_delimiter() -> char {
    ';'
}
fn default_output_delimiter() -> char {
    ','
}
fn default_encoding() -> String {
    "latin1".to_string()
}
fn default_concurrency() -> usize {
    5
}
fn default_key_column() -> String {
    "CNPJ_FUNDO_CLASSE".to_string()
}
fn default_date_column() -> String {
    "DT_COMPTC".to_string()
}

fn delimiter_byte(c: char) -> Result<u8> {
    if !c.is_ascii() {
        bail!("delimiter {c:?} is not a single ASCII character");
    }
    Ok(c as u8)
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that would otherwise fail half way through a run.
    pub fn validate(&self) -> Result<()> {
        for f in &self.families {
            f.delimiter_byte()?;
            f.encoding()?;
            if f.tabs.is_empty() {
                bail!("family {}: tabs must not be empty", f.name);
            }
        }
        for d in &self.datasets {
            d.delimiter_byte()?;
        }
        Ok(())
    }

    pub fn family(&self, name: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|f| f.name == name)
    }

    /// The stock CVM families and the datasets built from their outputs.
    pub fn builtin() -> Self {
        let fund_rules = || {
            SchemaRules::default()
                .alias("TP_FUNDO", "TP_FUNDO_CLASSE")
                .alias("CNPJ_FUNDO", "CNPJ_FUNDO_CLASSE")
        };
        let family = |name: &str, source: SourceLayout, schema: SchemaRules, concurrency: usize| FamilyConfig {
            name: name.to_string(),
            source,
            tabs: default_tabs(),
            cadence: Cadence::Monthly,
            delimiter: default_source_delimiter(),
            encoding: default_encoding(),
            schema,
            concurrency,
            output_dir: format!("out/{name}"),
            key_column: default_key_column(),
            date_column: default_date_column(),
            latest: None,
            parquet: false,
        };
        let template = |p: &str| SourceLayout::Template {
            pattern: p.to_string(),
        };

        let families = vec![
            FamilyConfig {
                latest: Some(GroupScope::EntityMonth),
                ..family(
                    "inf_diario",
                    template("inf_diario/inf_diario_fi_{year}{month}.csv"),
                    fund_rules()
                        .default_column("TP_FUNDO_CLASSE", "Não informado")
                        .deprecate("ID_SUBCLASSE"),
                    20,
                )
            },
            FamilyConfig {
                tabs: ["_IV_", "_X_1_", "_X_2_", "_X_3_"].map(String::from).to_vec(),
                ..family(
                    "fidc",
                    template("fidc/inf_mensal_fidc_tab{tab}{year}{month}.csv"),
                    fund_rules()
                        .default_column("ID_SUBCLASSE", "")
                        .default_column("TP_FUNDO_CLASSE", "Não informado"),
                    15,
                )
            },
            FamilyConfig {
                tabs: ["_", "_carteira_", "_rentab_ano_", "_rentab_mes_"]
                    .map(String::from)
                    .to_vec(),
                ..family(
                    "lamina",
                    template("lamina/lamina_fi{tab}{year}{month}.csv"),
                    fund_rules()
                        .default_column("ID_SUBCLASSE", "")
                        .default_column("TP_FUNDO_CLASSE", "Não informado"),
                    5,
                )
            },
            FamilyConfig {
                cadence: Cadence::Yearly,
                ..family(
                    "fip",
                    template("fip/inf_tri_quadri_fip_{year}.csv"),
                    fund_rules()
                        .default_column("ID_SUBCLASSE", "")
                        .default_column("TP_FUNDO_CLASSE", "FIP"),
                    5,
                )
            },
            family(
                "cda",
                SourceLayout::Directory {
                    dir: "cda".to_string(),
                    prefix: "cda".to_string(),
                },
                fund_rules()
                    .default_column("ID_SUBCLASSE", "")
                    .default_column("TP_FUNDO_CLASSE", "Não informado"),
                5,
            ),
        ];

        let dataset = |name: &str, source: &str, validity: Vec<Validity>| DatasetConfig {
            name: name.to_string(),
            sources: vec![source.to_string()],
            delimiter: default_output_delimiter(),
            key_column: default_key_column(),
            date_column: default_date_column(),
            month_filter: MonthFilter::DateSubstring,
            validity,
        };
        let datasets = vec![
            dataset("patrimonio", "out/fidc/fidc_IV_consolidated.csv", vec![
                Validity::PositiveNumber("TAB_IV_A_VL_PL".into()),
            ]),
            dataset("cotistas", "out/fidc/fidc_X_1_consolidated.csv", vec![
                Validity::PositiveInteger("TAB_X_NR_COTST".into()),
            ]),
            dataset("cotas", "out/fidc/fidc_X_2_consolidated.csv", vec![
                Validity::PositiveNumber("TAB_X_QT_COTA".into()),
                Validity::PositiveNumber("TAB_X_VL_COTA".into()),
            ]),
            dataset("rentabilidade", "out/fidc/fidc_X_3_consolidated.csv", vec![
                Validity::NonZeroNumber("TAB_X_VL_RENTAB_MES".into()),
            ]),
            DatasetConfig {
                month_filter: MonthFilter::Column("MES_RENTAB".into()),
                ..dataset("lamina_rentab_mes", "out/lamina/lamina_rentab_mes_consolidated.csv", vec![])
            },
            dataset("inf_diario", "out/inf_diario/inf_diario_latest.csv", vec![]),
        ];

        Config { families, datasets }
    }
}

impl FamilyConfig {
    pub fn delimiter_byte(&self) -> Result<u8> {
        delimiter_byte(self.delimiter).with_context(|| format!("family {}", self.name))
    }

    pub fn encoding(&self) -> Result<&'static Encoding> {
        match Encoding::for_label(self.encoding.as_bytes()) {
            Some(e) => Ok(e),
            None => bail!("family {}: unknown encoding {:?}", self.name, self.encoding),
        }
    }

    pub fn worker_limit(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn loader(&self) -> Result<TableLoader> {
        Ok(TableLoader::new(
            self.delimiter_byte()?,
            self.encoding()?,
            self.schema.clone(),
        ))
    }

    /// Periods to look for: one per year for yearly families, otherwise
    /// every requested month of every requested year.
    pub fn periods(&self, years: &[i32], months: &[u32]) -> Vec<Period> {
        match self.cadence {
            Cadence::Yearly => years.iter().map(|&y| Period::yearly(y)).collect(),
            Cadence::Monthly => years
                .iter()
                .flat_map(|&y| months.iter().map(move |&m| Period::monthly(y, m)))
                .collect(),
        }
    }

    /// Source path for one (tab, period) under `root`. `None` for directory sources.
    pub fn source_path(&self, root: &Path, tab: &str, period: &Period) -> Option<PathBuf> {
        let SourceLayout::Template { pattern } = &self.source else {
            return None;
        };
        let rel = pattern
            .replace("{tab}", tab)
            .replace("{year}", &period.year_str())
            .replace("{month}", &period.month_str());
        Some(root.join(rel))
    }

    pub fn output_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.output_dir)
    }

    /// `fidc` + `_X_1_` → `fidc_X_1_`; a blank tab gives `fidc_`.
    pub fn output_stem(&self, tab: &str) -> String {
        let tab = tab.trim_matches('_');
        if tab.is_empty() {
            format!("{}_", self.name)
        } else {
            format!("{}_{}_", self.name, tab)
        }
    }

    pub fn consolidated_path(&self, root: &Path, tab: &str) -> PathBuf {
        self.output_dir(root)
            .join(format!("{}consolidated.csv", self.output_stem(tab)))
    }

    pub fn latest_path(&self, root: &Path, tab: &str) -> PathBuf {
        self.output_dir(root)
            .join(format!("{}latest.csv", self.output_stem(tab)))
    }
}

impl DatasetConfig {
    pub fn delimiter_byte(&self) -> Result<u8> {
        delimiter_byte(self.delimiter).with_context(|| format!("dataset {}", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_is_valid() {
        let config = Config::builtin();
        config.validate().unwrap();
        let fidc = config.family("fidc").unwrap();
        assert_eq!(fidc.tabs.len(), 4);
        assert_eq!(fidc.worker_limit(), 15);
        assert_eq!(fidc.encoding().unwrap(), encoding_rs::WINDOWS_1252);
        assert_eq!(config.family("inf_diario").unwrap().latest, Some(GroupScope::EntityMonth));
    }

    #[test]
    fn template_paths() {
        let config = Config::builtin();
        let root = Path::new("/data");
        let fidc = config.family("fidc").unwrap();
        assert_eq!(
            fidc.source_path(root, "_X_2_", &Period::monthly(2024, 3)),
            Some(PathBuf::from("/data/fidc/inf_mensal_fidc_tab_X_2_202403.csv"))
        );
        let fip = config.family("fip").unwrap();
        assert_eq!(
            fip.source_path(root, "", &Period::yearly(2021)),
            Some(PathBuf::from("/data/fip/inf_tri_quadri_fip_2021.csv"))
        );
        assert_eq!(config.family("cda").unwrap().source_path(root, "", &Period::yearly(2021)), None);
    }

    #[test]
    fn output_names() {
        let config = Config::builtin();
        let root = Path::new("/data");
        let fidc = config.family("fidc").unwrap();
        assert_eq!(
            fidc.consolidated_path(root, "_X_1_"),
            PathBuf::from("/data/out/fidc/fidc_X_1_consolidated.csv")
        );
        let lamina = config.family("lamina").unwrap();
        assert_eq!(lamina.output_stem("_"), "lamina_");
        assert_eq!(
            lamina.latest_path(root, "_rentab_mes_"),
            PathBuf::from("/data/out/lamina/lamina_rentab_mes_latest.csv")
        );
    }

    #[test]
    fn periods_follow_cadence() {
        let config = Config::builtin();
        let monthly = config.family("fidc").unwrap().periods(&[2023, 2024], &[1, 12]);
        assert_eq!(monthly.len(), 4);
        assert_eq!(monthly[1], Period::monthly(2023, 12));
        let yearly = config.family("fip").unwrap().periods(&[2023, 2024], &[1, 12]);
        assert_eq!(yearly, vec![Period::yearly(2023), Period::yearly(2024)]);
    }

    #[test]
    fn yaml_round_trip_with_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cvmscraper.yaml");
        fs::write(
            &path,
            r#"
families:
  - name: fidc
    source:
      kind: template
      pattern: "fidc/inf_mensal_fidc_tab{tab}{year}{month}.csv"
    tabs: ["_X_1_"]
    output_dir: out/fidc
    concurrency: 0
    latest: entity
    schema:
      aliases:
        CNPJ_FUNDO: CNPJ_FUNDO_CLASSE
      defaults:
        - name: ID_SUBCLASSE
datasets:
  - name: rentab
    sources: ["out/lamina/*.csv"]
    month_filter:
      column: MES_RENTAB
    validity:
      - non_zero_number: VL_RENTAB
"#,
        )?;
        let config = Config::from_path(&path)?;
        let fidc = &config.families[0];
        assert_eq!(fidc.delimiter, ';');
        assert_eq!(fidc.encoding, "latin1");
        assert_eq!(fidc.worker_limit(), 1);
        assert_eq!(fidc.latest, Some(GroupScope::Entity));
        assert_eq!(fidc.schema.canonical("CNPJ_FUNDO"), "CNPJ_FUNDO_CLASSE");
        assert_eq!(fidc.schema.defaults[0].value, "");

        let ds = &config.datasets[0];
        assert_eq!(ds.delimiter, ',');
        assert_eq!(ds.key_column, "CNPJ_FUNDO_CLASSE");
        assert_eq!(ds.month_filter, MonthFilter::Column("MES_RENTAB".into()));
        assert_eq!(ds.validity, vec![Validity::NonZeroNumber("VL_RENTAB".into())]);
        Ok(())
    }

    #[test]
    fn bad_encoding_is_rejected() {
        let mut config = Config::builtin();
        config.families[0].encoding = "klingon".into();
        assert!(config.validate().is_err());
    }
}
