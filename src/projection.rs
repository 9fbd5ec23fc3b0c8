//! Growth projection for earmarked amounts: lump-sum compounding plus
//! optional systematic-investment (SIP) contributions up to an expiry.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SipFrequency {
    Weekly,
    #[serde(rename = "Bi-weekly")]
    BiWeekly,
    Monthly,
    #[serde(rename = "Bi-monthly")]
    BiMonthly,
    Quarterly,
    #[serde(rename = "Semi-annual")]
    SemiAnnual,
    Annual,
    Lumpsum,
}

impl SipFrequency {
    /// Contributions per month. Weekly and bi-weekly use the conventional
    /// calendar averages (4.33 weeks, 2.17 bi-weeks per month).
    fn monthly_factor(self) -> f64 {
        match self {
            SipFrequency::Weekly => 4.33,
            SipFrequency::BiWeekly => 2.17,
            SipFrequency::Monthly => 1.0,
            SipFrequency::BiMonthly => 2.0,
            SipFrequency::Quarterly => 1.0 / 3.0,
            SipFrequency::SemiAnnual => 1.0 / 6.0,
            SipFrequency::Annual => 1.0 / 12.0,
            SipFrequency::Lumpsum => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionParams {
    /// Starting amount (the earmarked slice of the asset).
    pub initial: f64,
    /// Contribution per SIP period.
    pub sip_amount: f64,
    pub sip_frequency: SipFrequency,
    /// Expected annual return, e.g. 0.10 for 10%.
    pub annual_rate: f64,
    /// Projection horizon in whole years.
    pub years: u32,
    /// Months of SIP contributions before they stop; `None` runs for the
    /// whole horizon.
    pub sip_months_cap: Option<u32>,
}

/// Project the value at the end of the horizon: the lump sum compounds for
/// the whole period, SIP contributions accumulate monthly until they stop
/// and the accumulated pot then keeps compounding.
pub fn project_value(params: &ProjectionParams) -> f64 {
    let total_months = params.years * 12;
    let monthly_sip = params.sip_amount * params.sip_frequency.monthly_factor();

    if monthly_sip <= 0.0 {
        return params.initial * (1.0 + params.annual_rate).powi(params.years as i32);
    }

    let monthly_rate = params.annual_rate / 12.0;
    let sip_months = params
        .sip_months_cap
        .map_or(total_months, |cap| cap.min(total_months));

    let lump_value = params.initial * (1.0 + monthly_rate).powi(total_months as i32);

    let mut sip_value = 0.0;
    if sip_months > 0 {
        let sip_accumulated = if monthly_rate == 0.0 {
            monthly_sip * f64::from(sip_months)
        } else {
            monthly_sip * (((1.0 + monthly_rate).powi(sip_months as i32) - 1.0) / monthly_rate)
        };
        let remaining_months = total_months - sip_months;
        sip_value = sip_accumulated * (1.0 + monthly_rate).powi(remaining_months as i32);
    }

    lump_value + sip_value
}
