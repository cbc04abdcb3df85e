// src/models/loan.rs

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::services::amortization::LoanError;

// ─── Conventions ──────────────────────────────────────────────────────────────

/// Day-count convention used to turn a date interval into a year fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, Default)]
pub enum CompoundingMethod {
    #[serde(rename = "30A/360")]
    Thirty360A,
    #[serde(rename = "30U/360")]
    Thirty360Us,
    #[default]
    #[serde(rename = "30E/360")]
    Thirty360E,
    #[serde(rename = "30E/360 ISDA")]
    Thirty360EIsda,
    #[serde(rename = "A/360")]
    Actual360,
    #[serde(rename = "A/365F")]
    Actual365Fixed,
    #[serde(rename = "A/A ISDA")]
    ActualActualIsda,
    #[serde(rename = "A/A AFB")]
    ActualActualAfb,
}

impl CompoundingMethod {
    pub const ALL: [CompoundingMethod; 8] = [
        CompoundingMethod::Thirty360A,
        CompoundingMethod::Thirty360Us,
        CompoundingMethod::Thirty360E,
        CompoundingMethod::Thirty360EIsda,
        CompoundingMethod::Actual360,
        CompoundingMethod::Actual365Fixed,
        CompoundingMethod::ActualActualIsda,
        CompoundingMethod::ActualActualAfb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompoundingMethod::Thirty360A => "30A/360",
            CompoundingMethod::Thirty360Us => "30U/360",
            CompoundingMethod::Thirty360E => "30E/360",
            CompoundingMethod::Thirty360EIsda => "30E/360 ISDA",
            CompoundingMethod::Actual360 => "A/360",
            CompoundingMethod::Actual365Fixed => "A/365F",
            CompoundingMethod::ActualActualIsda => "A/A ISDA",
            CompoundingMethod::ActualActualAfb => "A/A AFB",
        }
    }

    /// Actual-day conventions refuse reversed intervals.
    pub fn is_actual(&self) -> bool {
        matches!(
            self,
            CompoundingMethod::Actual360
                | CompoundingMethod::Actual365Fixed
                | CompoundingMethod::ActualActualIsda
                | CompoundingMethod::ActualActualAfb
        )
    }
}

impl fmt::Display for CompoundingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompoundingMethod {
    type Err = LoanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompoundingMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| LoanError::Validation(format!("unknown day-count convention '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoanType {
    #[default]
    Annuity,
    Linear,
    InterestOnly,
}

// ─── Inputs ───────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_annual_payments() -> u32 {
    12
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoanParams {
    pub principal: Decimal,
    /// Annual interest rate as a percentage, e.g. 5.0 means 5%
    pub annual_rate: Decimal,
    pub term_years: u32,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub first_payment_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub payment_end_of_month: bool,
    /// One of 1, 2, 4 or 12
    #[serde(default = "default_annual_payments")]
    pub annual_payments: u32,
    #[serde(default)]
    pub interest_only_period: u32,
    #[serde(default)]
    pub compounding_method: CompoundingMethod,
    #[serde(default)]
    pub loan_type: LoanType,
    /// Overrides the computed regular payment (annuity and linear loans only)
    #[serde(default)]
    pub payment_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SpecialPayment {
    pub amount: Decimal,
    pub first_payment_date: NaiveDate,
    /// Number of occurrences
    pub term_in_periods: u32,
    #[serde(default = "default_annual_payments")]
    pub annual_payments: u32,
}

// ─── Outputs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Payment {
    pub date: NaiveDate,
    pub payment_amount: Decimal,
    pub interest_amount: Decimal,
    pub regular_principal: Decimal,
    pub special_principal: Decimal,
    pub total_principal: Decimal,
    pub balance_end_of_period: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LoanSummary {
    pub loan_amount: Decimal,
    pub total_payment_amount: Decimal,
    pub total_principal_amount: Decimal,
    pub total_interest_amount: Decimal,
    pub residual_loan_balance: Decimal,
    pub repayment_to_principal: Decimal,
}

// ─── HTTP payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoanScheduleRequest {
    #[serde(flatten)]
    pub loan: LoanParams,
    #[serde(default)]
    pub special_payments: Vec<SpecialPayment>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoanScheduleResponse {
    pub schedule: Vec<Payment>,
    pub summary: LoanSummary,
}
