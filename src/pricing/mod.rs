//! European option pricing.
//!
//! The default backend is closed-form Black-Scholes with a single-pass
//! price-plus-Greeks kernel: d1, d2, discount factors, and the CDF/PDF
//! values are computed once and every output is derived from those shared
//! intermediates. Alternative backends plug in through [`OptionPricer`].

use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;
use std::f64::consts::PI;

use crate::core::tuning::TRADING_DAYS_PER_YEAR;
use crate::core::{EngineError, NumericFailure, OptionType, Result};
use crate::data::DataBars;

/// Standardized Greeks container.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Greeks {
    /// First derivative to spot.
    pub delta: f64,
    /// Second derivative to spot.
    pub gamma: f64,
    /// First derivative to volatility.
    pub vega: f64,
    /// First derivative to time.
    pub theta: f64,
    /// First derivative to rate.
    pub rho: f64,
}

/// Premium plus Greeks for one (spot, contract) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionQuote {
    pub premium: f64,
    pub greeks: Greeks,
}

/// Origin of the implied volatility actually used for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IvSource {
    /// Contract-chain quote supplied by an external provider.
    Provider,
    /// Annualized 30-bar realized volatility of the underlying.
    Realized30d,
    /// Config-supplied default.
    Default,
}

impl IvSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Realized30d => "realized_30d",
            Self::Default => "default",
        }
    }
}

/// Option contract parameters as configured.
///
/// `strike = None` requests an at-the-money contract; the strike then
/// resolves to the initial price rounded to `tick_size` with banker's
/// rounding. `iv` is the config-default volatility, consulted last in the
/// source chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub option_type: OptionType,
    #[serde(default)]
    pub strike: Option<f64>,
    pub maturity_days: u32,
    #[serde(default)]
    pub iv: Option<f64>,
    #[serde(default = "default_rate")]
    pub risk_free_rate: f64,
    #[serde(default = "default_contracts")]
    pub contracts: u32,
    #[serde(default = "default_tick")]
    pub tick_size: f64,
}

fn default_rate() -> f64 {
    0.04
}

fn default_contracts() -> u32 {
    1
}

fn default_tick() -> f64 {
    0.5
}

/// Contract with strike and volatility pinned down for a specific run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOptionSpec {
    pub option_type: OptionType,
    pub strike: f64,
    pub maturity_days: u32,
    pub iv: f64,
    pub iv_source: IvSource,
    pub risk_free_rate: f64,
    pub contracts: u32,
    pub tick_size: f64,
}

/// Resolves strike and volatility for a contract.
///
/// The volatility chain is provider quote, then 30-bar realized volatility,
/// then the config default; the first source that yields a usable value
/// wins and is recorded on the result.
pub fn resolve_option_spec(
    spec: &OptionSpec,
    s0: f64,
    bars: Option<&DataBars>,
    provider_quote: Option<f64>,
) -> Result<ResolvedOptionSpec> {
    if spec.maturity_days < 1 {
        return Err(EngineError::Config(format!(
            "option_spec.maturity_days: {}; must be >= 1",
            spec.maturity_days
        )));
    }
    if spec.tick_size <= 0.0 || !spec.tick_size.is_finite() {
        return Err(EngineError::Config(format!(
            "option_spec.tick_size: {}; must be finite and > 0",
            spec.tick_size
        )));
    }

    let strike = match spec.strike {
        Some(k) => k,
        None => round_to_tick(s0, spec.tick_size),
    };
    if strike <= 0.0 || !strike.is_finite() {
        return Err(EngineError::Config(format!(
            "option_spec.strike: {strike}; the resolved strike must be finite and > 0"
        )));
    }

    let (iv, iv_source) = if let Some(quote) = provider_quote.filter(|v| v.is_finite() && *v > 0.0)
    {
        (quote, IvSource::Provider)
    } else if let Some(realized) = bars.and_then(realized_vol_30d) {
        (realized, IvSource::Realized30d)
    } else if let Some(default_iv) = spec.iv {
        (default_iv, IvSource::Default)
    } else {
        return Err(EngineError::Config(
            "option_spec.iv: no provider quote, insufficient bars for realized vol, \
             and no config default; set option_spec.iv"
                .to_string(),
        ));
    };
    validate_iv(iv)?;

    Ok(ResolvedOptionSpec {
        option_type: spec.option_type,
        strike,
        maturity_days: spec.maturity_days,
        iv,
        iv_source,
        risk_free_rate: spec.risk_free_rate,
        contracts: spec.contracts,
        tick_size: spec.tick_size,
    })
}

/// Annualized close-to-close realized volatility over the last 30 bars.
fn realized_vol_30d(bars: &DataBars) -> Option<f64> {
    const WINDOW: usize = 30;
    if bars.len() < WINDOW + 1 {
        return None;
    }
    let closes = bars.closes();
    let tail = &closes[closes.len() - WINDOW - 1..];
    let rets: Vec<f64> = tail.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let mean = rets.iter().sum::<f64>() / rets.len() as f64;
    let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (rets.len() - 1) as f64;
    let vol = (var * TRADING_DAYS_PER_YEAR).sqrt();
    (vol.is_finite() && vol > 0.0).then_some(vol)
}

fn validate_iv(iv: f64) -> Result<()> {
    if !iv.is_finite() || iv <= 0.0 || iv > 5.0 {
        return Err(EngineError::Numeric(
            NumericFailure::InvalidIv,
            format!("iv: {iv}; implied volatility must lie in (0, 5]"),
        ));
    }
    Ok(())
}

/// Rounds to the tick grid with banker's rounding (ties to even).
pub fn round_to_tick(value: f64, tick: f64) -> f64 {
    (value / tick).round_ties_even() * tick
}

#[inline]
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

#[inline]
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

#[inline]
fn intrinsic(option_type: OptionType, spot: f64, strike: f64) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

/// Single-pass Black-Scholes price plus Greeks.
///
/// At or past expiry the quote is intrinsic value with zero Greeks. The
/// at-the-money case is regular: `ln(s/k) = 0` feeds d1/d2 directly.
pub fn black_scholes_quote(
    option_type: OptionType,
    spot: f64,
    strike: f64,
    rate: f64,
    iv: f64,
    maturity_years: f64,
) -> Result<OptionQuote> {
    validate_iv(iv)?;
    if spot <= 0.0 || !spot.is_finite() || strike <= 0.0 || !strike.is_finite() {
        return Err(EngineError::Numeric(
            NumericFailure::Overflow,
            format!("spot/strike: {spot}/{strike}; both must be finite and > 0"),
        ));
    }

    if maturity_years <= 0.0 {
        return Ok(OptionQuote {
            premium: intrinsic(option_type, spot, strike),
            greeks: Greeks::default(),
        });
    }

    let sqrt_t = maturity_years.sqrt();
    let sig_sqrt_t = iv * sqrt_t;
    let d1 = ((spot / strike).ln() + (rate + 0.5 * iv * iv) * maturity_years) / sig_sqrt_t;
    let d2 = d1 - sig_sqrt_t;

    let df = (-rate * maturity_years).exp();
    let nd1 = norm_cdf(d1);
    let nd2 = norm_cdf(d2);
    let pdf_d1 = norm_pdf(d1);

    let (premium, delta, theta, rho) = match option_type {
        OptionType::Call => {
            let p = spot * nd1 - strike * df * nd2;
            let th = -spot * pdf_d1 * iv / (2.0 * sqrt_t) - rate * strike * df * nd2;
            let rh = strike * maturity_years * df * nd2;
            (p, nd1, th, rh)
        }
        OptionType::Put => {
            let nmd1 = 1.0 - nd1;
            let nmd2 = 1.0 - nd2;
            let p = strike * df * nmd2 - spot * nmd1;
            let th = -spot * pdf_d1 * iv / (2.0 * sqrt_t) + rate * strike * df * nmd2;
            let rh = -strike * maturity_years * df * nmd2;
            (p, nd1 - 1.0, th, rh)
        }
    };

    let gamma = pdf_d1 / (spot * iv * sqrt_t);
    let vega = spot * pdf_d1 * sqrt_t;

    if !premium.is_finite() {
        return Err(EngineError::Numeric(
            NumericFailure::Overflow,
            format!("premium: non-finite for spot {spot}, strike {strike}, iv {iv}"),
        ));
    }

    Ok(OptionQuote {
        premium,
        greeks: Greeks {
            delta,
            gamma,
            vega,
            theta,
            rho,
        },
    })
}

/// Pricing backend abstraction; vectorized over underlying slices.
pub trait OptionPricer: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote(
        &self,
        option_type: OptionType,
        spot: f64,
        strike: f64,
        rate: f64,
        iv: f64,
        maturity_years: f64,
    ) -> Result<OptionQuote>;

    /// Premiums for a slice of spots at a fixed maturity.
    fn price_many(
        &self,
        option_type: OptionType,
        spots: &[f64],
        strike: f64,
        rate: f64,
        iv: f64,
        maturity_years: f64,
    ) -> Result<Vec<f64>> {
        spots
            .iter()
            .map(|&s| {
                self.quote(option_type, s, strike, rate, iv, maturity_years)
                    .map(|q| q.premium)
            })
            .collect()
    }
}

/// Closed-form European Black-Scholes backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlackScholesPricer;

impl OptionPricer for BlackScholesPricer {
    fn name(&self) -> &'static str {
        "black_scholes"
    }

    fn quote(
        &self,
        option_type: OptionType,
        spot: f64,
        strike: f64,
        rate: f64,
        iv: f64,
        maturity_years: f64,
    ) -> Result<OptionQuote> {
        black_scholes_quote(option_type, spot, strike, rate, iv, maturity_years)
    }
}

/// Looks up a pricing backend by name.
pub fn get_pricer(name: &str) -> Result<Box<dyn OptionPricer>> {
    match name {
        "black_scholes" => Ok(Box::new(BlackScholesPricer)),
        other => Err(EngineError::Config(format!(
            "pricer: '{other}'; only black_scholes is registered"
        ))),
    }
}

/// Premium per share at every step of one path, with decaying maturity.
///
/// Maturity is clamped to the simulated horizon so the contract never has
/// negative time value inside the window; at zero remaining days the
/// premium is intrinsic.
pub fn price_along_path(
    pricer: &dyn OptionPricer,
    path: &[f64],
    spec: &ResolvedOptionSpec,
) -> Result<Vec<f64>> {
    if path.is_empty() {
        return Err(EngineError::Config(
            "path: empty slice passed to the repricer".to_string(),
        ));
    }
    let horizon_days = (path.len() - 1) as u32;
    let effective_maturity = spec.maturity_days.min(horizon_days.max(1));

    let mut premiums = Vec::with_capacity(path.len());
    for (step, &spot) in path.iter().enumerate() {
        // Bankrupt paths are pinned to zero; the contract is worth intrinsic.
        if spot <= 0.0 {
            premiums.push(intrinsic(spec.option_type, 0.0, spec.strike));
            continue;
        }
        let remaining_days = effective_maturity.saturating_sub(step as u32);
        let ttm_years = remaining_days as f64 / TRADING_DAYS_PER_YEAR;
        let quote = black_scholes_quote(
            spec.option_type,
            spot,
            spec.strike,
            spec.risk_free_rate,
            spec.iv,
            ttm_years,
        )?;
        premiums.push(quote.premium);
    }
    Ok(premiums)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn call_price_matches_reference_value() {
        // Hull-style reference: S=100, K=100, r=5%, sigma=20%, T=1 -> 10.4506.
        let q = black_scholes_quote(OptionType::Call, 100.0, 100.0, 0.05, 0.20, 1.0).unwrap();
        assert_relative_eq!(q.premium, 10.4506, epsilon = 1.0e-3);
        assert!(q.greeks.delta > 0.5 && q.greeks.delta < 0.7);
        assert!(q.greeks.gamma > 0.0 && q.greeks.vega > 0.0);
    }

    #[test]
    fn put_call_parity_holds() {
        let (s, k, r, iv, t) = (105.0, 100.0, 0.03, 0.25, 0.5);
        let call = black_scholes_quote(OptionType::Call, s, k, r, iv, t).unwrap();
        let put = black_scholes_quote(OptionType::Put, s, k, r, iv, t).unwrap();
        let parity = call.premium - put.premium - (s - k * (-r * t).exp());
        assert!(parity.abs() < 1.0e-10);
    }

    #[test]
    fn expired_contract_is_intrinsic_with_zero_greeks() {
        let q = black_scholes_quote(OptionType::Call, 120.0, 100.0, 0.05, 0.2, 0.0).unwrap();
        assert_relative_eq!(q.premium, 20.0, epsilon = 1.0e-12);
        assert_eq!(q.greeks, Greeks::default());
    }

    #[test]
    fn invalid_iv_is_rejected() {
        let err = black_scholes_quote(OptionType::Call, 100.0, 100.0, 0.05, 0.0, 1.0).unwrap_err();
        assert_eq!(err.tag(), "NumericError:InvalidIV");
        let err = black_scholes_quote(OptionType::Call, 100.0, 100.0, 0.05, 6.0, 1.0).unwrap_err();
        assert_eq!(err.tag(), "NumericError:InvalidIV");
    }

    #[test]
    fn atm_is_regular() {
        let q = black_scholes_quote(OptionType::Call, 100.0, 100.0, 0.0, 0.2, 0.25).unwrap();
        assert!(q.premium > 0.0 && q.premium.is_finite());
        // ATM forward delta ~ 0.52 at these parameters.
        assert!((q.greeks.delta - 0.52).abs() < 0.03);
    }

    #[test]
    fn bankers_rounding_resolves_atm_strikes() {
        assert_eq!(round_to_tick(100.25, 0.5), 100.0);
        assert_eq!(round_to_tick(100.75, 0.5), 101.0);
        assert_eq!(round_to_tick(100.3, 0.5), 100.5);
    }

    #[test]
    fn iv_chain_prefers_provider_then_realized_then_default() {
        let spec = OptionSpec {
            option_type: OptionType::Call,
            strike: None,
            maturity_days: 30,
            iv: Some(0.25),
            risk_free_rate: 0.04,
            contracts: 1,
            tick_size: 0.5,
        };
        let bars =
            crate::data::synthetic_bars("T", crate::data::Interval::Daily, 100.0, 120, 0.0, 0.02, 3)
                .unwrap();

        let with_quote = resolve_option_spec(&spec, 100.0, Some(&bars), Some(0.4)).unwrap();
        assert_eq!(with_quote.iv_source, IvSource::Provider);
        assert_relative_eq!(with_quote.iv, 0.4);

        let with_bars = resolve_option_spec(&spec, 100.0, Some(&bars), None).unwrap();
        assert_eq!(with_bars.iv_source, IvSource::Realized30d);

        let with_default = resolve_option_spec(&spec, 100.0, None, None).unwrap();
        assert_eq!(with_default.iv_source, IvSource::Default);
        assert_relative_eq!(with_default.iv, 0.25);
    }

    #[test]
    fn repricer_decays_to_intrinsic() {
        let spec = ResolvedOptionSpec {
            option_type: OptionType::Call,
            strike: 100.0,
            maturity_days: 5,
            iv: 0.3,
            iv_source: IvSource::Default,
            risk_free_rate: 0.0,
            contracts: 1,
            tick_size: 0.5,
        };
        let path = vec![100.0, 102.0, 104.0, 103.0, 105.0, 110.0];
        let premiums = price_along_path(&BlackScholesPricer, &path, &spec).unwrap();
        assert_eq!(premiums.len(), 6);
        // Final step has zero remaining maturity: intrinsic only.
        assert_relative_eq!(premiums[5], 10.0, epsilon = 1.0e-12);
        assert!(premiums[0] > 0.0);
    }
}
