use rand::Rng;
use rand_distr::{Distribution as DistR, Exp};
use std::str::FromStr;

/// Inter-arrival gap distribution in nanoseconds.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Distribution {
    Constant(u64),
    Exponential(f64),
    Bimodal(f64, u64, u64),
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match *self {
            Distribution::Constant(_) => "constant",
            Distribution::Exponential(_) => "exponential",
            Distribution::Bimodal(_, _, _) => "bimodal",
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        match *self {
            Distribution::Constant(m) => m,
            Distribution::Exponential(m) => match Exp::new(1.0 / m) {
                Ok(exp) => exp.sample(rng) as u64,
                Err(_) => 0,
            },
            Distribution::Bimodal(p, v1, v2) => {
                if rng.gen_bool(p) {
                    v1
                } else {
                    v2
                }
            }
        }
    }

    pub fn mean(&self) -> f64 {
        match *self {
            Distribution::Constant(m) => m as f64,
            Distribution::Exponential(m) => m,
            Distribution::Bimodal(p, v1, v2) => p * v1 as f64 + (1.0 - p) * v2 as f64,
        }
    }
}

/// The shape of the arrival process, independent of the rate.
///
/// Bimodal factors are multiples of the mean gap; `bimodal:0.9:0.5:5.5`
/// keeps the mean unchanged while sending one gap in ten at 5.5x.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ArrivalShape {
    Exponential,
    Constant,
    Bimodal(f64, f64, f64),
}

impl ArrivalShape {
    /// Concrete gap distribution for a stream that should average
    /// `mean_gap_ns` between sends.
    pub fn with_mean(&self, mean_gap_ns: f64) -> Distribution {
        match *self {
            ArrivalShape::Exponential => Distribution::Exponential(mean_gap_ns),
            ArrivalShape::Constant => Distribution::Constant(mean_gap_ns as u64),
            ArrivalShape::Bimodal(p, f1, f2) => Distribution::Bimodal(
                p,
                (mean_gap_ns * f1) as u64,
                (mean_gap_ns * f2) as u64,
            ),
        }
    }
}

impl FromStr for ArrivalShape {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = spec.split(':').collect();
        match tokens[0] {
            "exponential" if tokens.len() == 1 => Ok(ArrivalShape::Exponential),
            "constant" if tokens.len() == 1 => Ok(ArrivalShape::Constant),
            "bimodal" if tokens.len() == 4 => {
                let parse = |s: &str| {
                    s.parse::<f64>()
                        .map_err(|e| format!("bad bimodal parameter {:?}: {}", s, e))
                };
                let prob = parse(tokens[1])?;
                let f1 = parse(tokens[2])?;
                let f2 = parse(tokens[3])?;
                if !(0.0..=1.0).contains(&prob) {
                    return Err(format!("bimodal probability out of range: {}", prob));
                }
                if f1 <= 0.0 || f2 <= 0.0 {
                    return Err("bimodal factors must be positive".to_string());
                }
                Ok(ArrivalShape::Bimodal(prob, f1, f2))
            }
            _ => Err(format!("bad arrival spec: {}", spec)),
        }
    }
}
