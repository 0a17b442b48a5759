//! Plain-text key/value configuration.
//!
//! Lines hold `key value` pairs (an optional `=` between them is accepted);
//! `#` starts a comment. Unknown keys are rejected so typos surface before
//! any allocation happens.

use std::fs;
use std::path::Path;

use crate::activation::Activation;
use crate::errors::{PintError, PintResult};
use crate::pint::CoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Dense,
    Convolutional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenLayerType {
    Replicate,
    Activate,
}

impl OpenLayerType {
    pub fn name(self) -> &'static str {
        match self {
            OpenLayerType::Replicate => "replicate",
            OpenLayerType::Activate => "activate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HessianKind {
    Bfgs,
    Lbfgs,
    Identity,
}

impl HessianKind {
    pub fn name(self) -> &'static str {
        match self {
            HessianKind::Bfgs => "BFGS",
            HessianKind::Lbfgs => "L-BFGS",
            HessianKind::Identity => "Identity",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ntraining: usize,
    pub nvalidation: usize,
    pub nfeatures: usize,
    pub nclasses: usize,
    pub nchannels: usize,
    pub nlayers: usize,
    pub t_final: f64,
    pub activation: Activation,
    pub network_type: NetworkType,
    pub type_openlayer: OpenLayerType,

    pub gamma_tik: f64,
    pub gamma_ddt: f64,
    pub gamma_class: f64,
    pub weights_init: f64,
    pub weights_open_init: f64,
    pub weights_class_init: f64,

    pub stepsize_init: f64,
    pub optim_maxiter: usize,
    pub gtol: f64,
    pub ls_maxiter: usize,
    pub ls_factor: f64,
    pub hessian: HessianKind,
    pub lbfgs_stages: usize,
    pub validationlevel: i32,

    pub braid: CoreConfig,
    pub braid_abstoladj: f64,

    pub datafolder: String,
    pub ftrain_ex: String,
    pub ftrain_labels: String,
    pub fval_ex: String,
    pub fval_labels: String,
    pub weightsopenfile: Option<String>,
    pub weightsclassificationfile: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ntraining: 5000,
            nvalidation: 200,
            nfeatures: 2,
            nclasses: 5,
            nchannels: 8,
            nlayers: 32,
            t_final: 10.0,
            activation: Activation::ReLu,
            network_type: NetworkType::Dense,
            type_openlayer: OpenLayerType::Replicate,
            gamma_tik: 1e-7,
            gamma_ddt: 1e-7,
            gamma_class: 1e-7,
            weights_init: 0.0,
            weights_open_init: 0.001,
            weights_class_init: 0.001,
            stepsize_init: 1.0,
            optim_maxiter: 500,
            gtol: 1e-8,
            ls_maxiter: 20,
            ls_factor: 0.5,
            hessian: HessianKind::Lbfgs,
            lbfgs_stages: 20,
            validationlevel: 1,
            braid: CoreConfig::default(),
            braid_abstoladj: 1e-6,
            datafolder: "NONE".into(),
            ftrain_ex: "NONE".into(),
            ftrain_labels: "NONE".into(),
            fval_ex: "NONE".into(),
            fval_labels: "NONE".into(),
            weightsopenfile: None,
            weightsclassificationfile: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> PintResult<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| PintError::Config(format!("cannot read {}: {e}", path.display())))?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> PintResult<Config> {
        let mut config = Config::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.splitn(2, |c: char| c == '=' || c.is_whitespace());
            let key = tokens.next().unwrap_or("").trim();
            let value = tokens.next().unwrap_or("").trim_matches('=').trim();
            if value.is_empty() {
                return Err(PintError::Config(format!("line {}: missing value for {key}", lineno + 1)));
            }
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> PintResult<()> {
        match key {
            "ntraining" => self.ntraining = parse_num(key, value)?,
            "nvalidation" => self.nvalidation = parse_num(key, value)?,
            "nfeatures" => self.nfeatures = parse_num(key, value)?,
            "nclasses" => self.nclasses = parse_num(key, value)?,
            "nchannels" => self.nchannels = parse_num(key, value)?,
            "nlayers" => self.nlayers = parse_num(key, value)?,
            "T" => self.t_final = parse_num(key, value)?,
            "activation" => self.activation = Activation::parse(value)?,
            "network_type" => {
                self.network_type = match value {
                    "dense" => NetworkType::Dense,
                    "convolutional" => NetworkType::Convolutional,
                    other => {
                        return Err(PintError::Config(format!("invalid network type: {other}")))
                    }
                }
            }
            "type_openlayer" => {
                self.type_openlayer = match value {
                    "replicate" => OpenLayerType::Replicate,
                    "activate" => OpenLayerType::Activate,
                    other => {
                        return Err(PintError::Config(format!("invalid type_openlayer: {other}")))
                    }
                }
            }
            "gamma_tik" => self.gamma_tik = parse_num(key, value)?,
            "gamma_ddt" => self.gamma_ddt = parse_num(key, value)?,
            "gamma_class" => self.gamma_class = parse_num(key, value)?,
            "weights_init" => self.weights_init = parse_num(key, value)?,
            "weights_open_init" => self.weights_open_init = parse_num(key, value)?,
            "weights_class_init" => self.weights_class_init = parse_num(key, value)?,
            "stepsize" => self.stepsize_init = parse_num(key, value)?,
            "optim_maxiter" => self.optim_maxiter = parse_num(key, value)?,
            "gtol" => self.gtol = parse_num(key, value)?,
            "ls_maxiter" => self.ls_maxiter = parse_num(key, value)?,
            "ls_factor" => self.ls_factor = parse_num(key, value)?,
            "hessian_approx" => {
                self.hessian = match value {
                    "BFGS" => HessianKind::Bfgs,
                    "L-BFGS" => HessianKind::Lbfgs,
                    "Identity" => HessianKind::Identity,
                    other => {
                        return Err(PintError::Config(format!(
                            "invalid Hessian approximation: {other}"
                        )))
                    }
                }
            }
            "lbfgs_stages" => self.lbfgs_stages = parse_num(key, value)?,
            "validationlevel" => self.validationlevel = parse_num(key, value)?,
            "braid_maxlevels" => self.braid.max_levels = parse_num(key, value)?,
            "braid_mincoarse" => self.braid.min_coarse = parse_num(key, value)?,
            "braid_cfactor" => self.braid.cfactor = parse_num(key, value)?,
            "braid_cfactor0" => self.braid.cfactor0 = parse_num(key, value)?,
            "braid_maxiter" => self.braid.max_iter = parse_num(key, value)?,
            "braid_abstol" => self.braid.abs_tol = parse_num(key, value)?,
            "braid_adjtol" => self.braid_abstoladj = parse_num(key, value)?,
            "braid_printlevel" => self.braid.print_level = parse_num(key, value)?,
            "braid_accesslevel" => self.braid.access_level = parse_num(key, value)?,
            "braid_setskip" => self.braid.skip = parse_num::<i64>(key, value)? != 0,
            "braid_fmg" => self.braid.fmg = parse_num::<i64>(key, value)? != 0,
            "braid_nrelax" => self.braid.nrelax = parse_num(key, value)?,
            "braid_nrelax0" => self.braid.nrelax0 = parse_num(key, value)?,
            "datafolder" => self.datafolder = value.into(),
            "ftrain_ex" => self.ftrain_ex = value.into(),
            "ftrain_labels" => self.ftrain_labels = value.into(),
            "fval_ex" => self.fval_ex = value.into(),
            "fval_labels" => self.fval_labels = value.into(),
            "weightsopenfile" => self.weightsopenfile = Some(value.into()),
            "weightsclassificationfile" => self.weightsclassificationfile = Some(value.into()),
            other => return Err(PintError::Config(format!("unknown key: {other}"))),
        }
        Ok(())
    }

    pub fn validate(&self) -> PintResult<()> {
        if self.nlayers < 3 {
            return Err(PintError::Config(format!(
                "nlayers={} too small: need opening, one hidden and classification layer",
                self.nlayers
            )));
        }
        if self.nfeatures > self.nchannels || self.nclasses > self.nchannels {
            return Err(PintError::Config(
                "network too narrow: require nfeatures <= nchannels and nclasses <= nchannels"
                    .into(),
            ));
        }
        if self.network_type == NetworkType::Convolutional && self.nchannels % self.nfeatures != 0 {
            return Err(PintError::Config(
                "convolutional network requires nchannels to be a multiple of nfeatures".into(),
            ));
        }
        if self.ls_factor <= 0.0 || self.ls_factor >= 1.0 {
            return Err(PintError::Config(format!(
                "ls_factor must lie in (0, 1), got {}",
                self.ls_factor
            )));
        }
        Ok(())
    }

    /// Fine time-step size implied by the final time.
    pub fn dt(&self) -> f64 {
        self.t_final / (self.nlayers - 2) as f64
    }

    pub fn data_path(&self, file: &str) -> String {
        format!("{}/{}", self.datafolder, file)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> PintResult<T> {
    value
        .parse()
        .map_err(|_| PintError::Config(format!("invalid value for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let cfg = Config::parse(
            "nlayers 8\nnchannels = 4\nnfeatures 2\nnclasses 2\nactivation tanh\n# comment\nhessian_approx L-BFGS\nT 4.0\n",
        )
        .unwrap();
        assert_eq!(cfg.nlayers, 8);
        assert_eq!(cfg.nchannels, 4);
        assert_eq!(cfg.activation, Activation::Tanh);
        assert_eq!(cfg.hessian, HessianKind::Lbfgs);
        assert_eq!(cfg.dt(), 4.0 / 6.0);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_enums() {
        assert!(Config::parse("nolayers 8\n").is_err());
        assert!(Config::parse("activation softplus\n").is_err());
        assert!(Config::parse("nlayers 2\n").is_err());
    }

    #[test]
    fn rejects_too_narrow_networks() {
        let err = Config::parse("nlayers 5\nnchannels 2\nnfeatures 4\nnclasses 2\n");
        assert!(err.is_err());
    }
}
