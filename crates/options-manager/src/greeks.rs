//! Black-Scholes Greeks for single contracts and multi-leg positions.
//!
//! Pure functions with no shared state; safe to call from any number of
//! threads. The computation timestamp is an input, so identical inputs give a
//! bit-for-bit identical [`GreeksSnapshot`].

use chrono::{DateTime, Utc};
use options_guard_gateway::{OptionRight, OptionsChain};
use rust_decimal::prelude::ToPrimitive;
use std::f64::consts::PI;

use crate::error::DomainError;
use crate::types::{GreeksSnapshot, Leg, PricingInputs};

const DAYS_PER_YEAR: f64 = 365.0;

/// Standard normal CDF via the Abramowitz & Stegun 7.1.26 error function
/// (max error < 1.5e-7).
#[must_use]
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

#[must_use]
pub fn norm_pdf(x: f64) -> f64 {
    (-(x * x) / 2.0).exp() / (2.0 * PI).sqrt()
}

fn erf(x: f64) -> f64 {
    let a1 = 0.254_829_592;
    let a2 = -0.284_496_736;
    let a3 = 1.421_413_741;
    let a4 = -1.453_152_027;
    let a5 = 1.061_405_429;
    let p = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Rejects inputs the model cannot price.
///
/// # Errors
///
/// Returns [`DomainError`] for non-finite values, negative time, non-positive
/// volatility, or non-positive spot/strike.
pub fn validate(inputs: &PricingInputs) -> Result<(), DomainError> {
    for (name, value) in [
        ("spot", inputs.spot),
        ("strike", inputs.strike),
        ("days_to_expiry", inputs.days_to_expiry),
        ("volatility", inputs.volatility),
        ("rate", inputs.rate),
    ] {
        if !value.is_finite() {
            return Err(DomainError::NonFinite(name));
        }
    }
    if inputs.days_to_expiry < 0.0 {
        return Err(DomainError::NegativeTime(inputs.days_to_expiry));
    }
    if inputs.volatility <= 0.0 {
        return Err(DomainError::NonPositiveVolatility(inputs.volatility));
    }
    if inputs.spot <= 0.0 {
        return Err(DomainError::NonPositivePrice {
            field: "spot",
            value: inputs.spot,
        });
    }
    if inputs.strike <= 0.0 {
        return Err(DomainError::NonPositivePrice {
            field: "strike",
            value: inputs.strike,
        });
    }
    Ok(())
}

/// Greeks of one contract, per share.
///
/// Theta is per calendar day, vega per vol point, rho per 1% rate. At
/// expiration the intrinsic limit is returned.
///
/// # Errors
///
/// Returns [`DomainError`] when [`validate`] rejects the inputs.
pub fn calculate(
    inputs: &PricingInputs,
    computed_at: DateTime<Utc>,
) -> Result<GreeksSnapshot, DomainError> {
    validate(inputs)?;

    let PricingInputs {
        spot: s,
        strike: k,
        volatility: sigma,
        rate: r,
        right,
        ..
    } = *inputs;

    if inputs.days_to_expiry == 0.0 {
        return Ok(expiration_limit(inputs, computed_at));
    }

    let t = inputs.days_to_expiry / DAYS_PER_YEAR;
    let sqrt_t = t.sqrt();
    let d1 = ((s / k).ln() + (r + sigma * sigma / 2.0) * t) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    let discount = (-r * t).exp();
    let pdf_d1 = norm_pdf(d1);

    let gamma = pdf_d1 / (s * sigma * sqrt_t);
    let vega = s * pdf_d1 * sqrt_t / 100.0;
    let decay = -s * pdf_d1 * sigma / (2.0 * sqrt_t);

    let (delta, theta, rho, price) = match right {
        OptionRight::Call => (
            norm_cdf(d1),
            (decay - r * k * discount * norm_cdf(d2)) / DAYS_PER_YEAR,
            k * t * discount * norm_cdf(d2) / 100.0,
            s * norm_cdf(d1) - k * discount * norm_cdf(d2),
        ),
        OptionRight::Put => (
            norm_cdf(d1) - 1.0,
            (decay + r * k * discount * norm_cdf(-d2)) / DAYS_PER_YEAR,
            -k * t * discount * norm_cdf(-d2) / 100.0,
            k * discount * norm_cdf(-d2) - s * norm_cdf(-d1),
        ),
    };

    Ok(GreeksSnapshot {
        delta,
        gamma,
        theta,
        vega,
        rho,
        price,
        computed_at,
        inputs: vec![*inputs],
    })
}

fn expiration_limit(inputs: &PricingInputs, computed_at: DateTime<Utc>) -> GreeksSnapshot {
    let (delta, price) = match inputs.right {
        OptionRight::Call if inputs.spot > inputs.strike => (1.0, inputs.spot - inputs.strike),
        OptionRight::Put if inputs.spot < inputs.strike => (-1.0, inputs.strike - inputs.spot),
        _ => (0.0, 0.0),
    };
    GreeksSnapshot {
        delta,
        gamma: 0.0,
        theta: 0.0,
        vega: 0.0,
        rho: 0.0,
        price,
        computed_at,
        inputs: vec![*inputs],
    }
}

/// Signed sum of per-contract snapshots.
#[must_use]
pub fn combine(parts: &[(i32, GreeksSnapshot)], computed_at: DateTime<Utc>) -> GreeksSnapshot {
    let mut out = GreeksSnapshot {
        delta: 0.0,
        gamma: 0.0,
        theta: 0.0,
        vega: 0.0,
        rho: 0.0,
        price: 0.0,
        computed_at,
        inputs: Vec::with_capacity(parts.len()),
    };
    for (qty, g) in parts {
        let q = f64::from(*qty);
        out.delta += q * g.delta;
        out.gamma += q * g.gamma;
        out.theta += q * g.theta;
        out.vega += q * g.vega;
        out.rho += q * g.rho;
        out.price += q * g.price;
        out.inputs.extend(g.inputs.iter().copied());
    }
    out
}

/// Pricing inputs for a leg, taking implied volatility from the chain.
///
/// # Errors
///
/// Returns [`DomainError::MissingVolatility`] when the chain has no quote for the leg.
pub fn leg_inputs(
    leg: &Leg,
    spot: f64,
    chain: &OptionsChain,
    rate: f64,
    now: DateTime<Utc>,
) -> Result<PricingInputs, DomainError> {
    let c = &leg.contract;
    let quote = chain
        .find(c.expiry, c.strike, c.right)
        .ok_or_else(|| DomainError::MissingVolatility(c.display_name()))?;
    Ok(PricingInputs {
        spot,
        strike: c.strike.to_f64().ok_or(DomainError::NonFinite("strike"))?,
        days_to_expiry: c.days_to_expiry(now) as f64,
        volatility: quote.iv,
        rate,
        right: c.right,
    })
}

/// Net Greeks of one structure unit.
///
/// # Errors
///
/// Returns the first [`DomainError`] raised by any leg.
pub fn position_greeks(
    legs: &[Leg],
    spot: f64,
    chain: &OptionsChain,
    rate: f64,
    now: DateTime<Utc>,
) -> Result<GreeksSnapshot, DomainError> {
    let parts = legs
        .iter()
        .map(|leg| {
            let inputs = leg_inputs(leg, spot, chain, rate, now)?;
            Ok((leg.quantity, calculate(&inputs, now)?))
        })
        .collect::<Result<Vec<_>, DomainError>>()?;
    Ok(combine(&parts, now))
}
