// src/services/amortization/schedule.rs

use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::ops::Bound::Excluded;
use tracing::debug;

use super::{LoanError, day_count_factor, is_month_end};
use crate::models::loan::{LoanParams, LoanSummary, LoanType, Payment, SpecialPayment};

const VALID_ANNUAL_PAYMENTS: [u32; 4] = [1, 2, 4, 12];

fn quantize(amount: Decimal) -> Decimal {
    amount.round_dp(2)
}

fn add_months(date: NaiveDate, months: u32) -> Result<NaiveDate, LoanError> {
    date.checked_add_months(Months::new(months))
        .ok_or_else(|| LoanError::Validation(format!("date {} is out of range", date)))
}

fn sub_months(date: NaiveDate, months: u32) -> Result<NaiveDate, LoanError> {
    date.checked_sub_months(Months::new(months))
        .ok_or_else(|| LoanError::Validation(format!("date {} is out of range", date)))
}

fn end_of_month(date: NaiveDate) -> NaiveDate {
    let mut d = date;
    while let Some(next) = d.succ_opt() {
        if next.month() != d.month() {
            break;
        }
        d = next;
    }
    d
}

fn out_of_range(what: &str) -> LoanError {
    LoanError::Validation(format!("{} is out of range", what))
}

fn validate_annual_payments(annual_payments: u32) -> Result<(), LoanError> {
    if VALID_ANNUAL_PAYMENTS.contains(&annual_payments) {
        Ok(())
    } else {
        Err(LoanError::Validation(format!(
            "annual_payments must be one of 1, 2, 4 or 12 (got {})",
            annual_payments
        )))
    }
}

/// A loan and its special payments; schedules are rebuilt on demand.
#[derive(Debug, Clone)]
pub struct Loan {
    params: LoanParams,
    /// Annual rate as a fraction, quantized to 4 places
    rate: Decimal,
    special_payments: Vec<SpecialPayment>,
}

impl Loan {
    pub fn new(params: LoanParams) -> Result<Self, LoanError> {
        if params.principal.is_sign_negative() {
            return Err(LoanError::Validation("principal must not be negative".into()));
        }
        if params.annual_rate.is_sign_negative() {
            return Err(LoanError::Validation("annual_rate must not be negative".into()));
        }
        if params.term_years == 0 {
            return Err(LoanError::Validation("term_years must be positive".into()));
        }
        validate_annual_payments(params.annual_payments)?;

        let total_periods = params
            .term_years
            .checked_mul(params.annual_payments)
            .ok_or_else(|| out_of_range("term_years"))?;
        let term_months = params
            .term_years
            .checked_mul(12)
            .ok_or_else(|| out_of_range("term_years"))?;
        if params.loan_type != LoanType::InterestOnly && params.interest_only_period >= total_periods {
            return Err(LoanError::Validation(format!(
                "interest_only_period must be lower than the {} scheduled periods",
                total_periods
            )));
        }
        if let Some(first) = params.first_payment_date {
            if first < params.start_date {
                return Err(LoanError::Validation(
                    "first_payment_date must not precede start_date".into(),
                ));
            }
        }
        if let Some(amount) = params.payment_amount {
            if amount <= Decimal::ZERO {
                return Err(LoanError::Validation("payment_amount must be positive".into()));
            }
        }

        let rate = (params.annual_rate / dec!(100)).round_dp(4);

        let loan = Self {
            params,
            rate,
            special_payments: Vec::new(),
        };
        // maturity must stay within the calendar
        add_months(loan.anchor_date()?, term_months)?;
        Ok(loan)
    }

    pub fn params(&self) -> &LoanParams {
        &self.params
    }

    pub fn add_special_payment(&mut self, special: SpecialPayment) -> Result<(), LoanError> {
        if special.amount <= Decimal::ZERO {
            return Err(LoanError::Validation("special payment amount must be positive".into()));
        }
        if special.term_in_periods == 0 {
            return Err(LoanError::Validation(
                "special payment term_in_periods must be positive".into(),
            ));
        }
        validate_annual_payments(special.annual_payments)?;

        let last_offset = (special.term_in_periods - 1)
            .checked_mul(12 / special.annual_payments)
            .ok_or_else(|| out_of_range("special payment term_in_periods"))?;
        let last = add_months(special.first_payment_date, last_offset)?;
        let maturity = self.maturity_date()?;
        if special.first_payment_date <= self.params.start_date || last > maturity {
            return Err(LoanError::Validation(format!(
                "special payments must fall after {} and no later than {}",
                self.params.start_date, maturity
            )));
        }

        self.special_payments.push(special);
        Ok(())
    }

    /// Date of the last scheduled period.
    pub fn maturity_date(&self) -> Result<NaiveDate, LoanError> {
        self.period_end(self.anchor_date()?, self.total_periods())
    }

    fn total_periods(&self) -> u32 {
        self.params.term_years * self.params.annual_payments
    }

    fn months_per_period(&self) -> u32 {
        12 / self.params.annual_payments
    }

    fn interest_only_period(&self) -> u32 {
        match self.params.loan_type {
            LoanType::InterestOnly => self.total_periods(),
            _ => self.params.interest_only_period,
        }
    }

    /// Regular installment: total payment for annuities, principal for linear loans.
    fn regular_payment(&self) -> Result<Decimal, LoanError> {
        if self.params.loan_type == LoanType::InterestOnly {
            return Ok(Decimal::ZERO);
        }
        if let Some(amount) = self.params.payment_amount {
            return Ok(amount);
        }

        let periods = self.total_periods() - self.interest_only_period();
        let principal = self.params.principal;
        let n = Decimal::from(periods);

        match self.params.loan_type {
            LoanType::Annuity if !self.rate.is_zero() => {
                let i = self.rate / Decimal::from(self.params.annual_payments);
                // (1 + i)^-n is below decimal precision once the growth overflows
                let discount = (Decimal::ONE + i)
                    .checked_powu(u64::from(periods))
                    .map(|growth| Decimal::ONE / growth)
                    .unwrap_or(Decimal::ZERO);
                let interest = principal
                    .checked_mul(i)
                    .ok_or_else(|| out_of_range("principal"))?;
                Ok(quantize(interest / (Decimal::ONE - discount)))
            }
            _ => Ok(quantize(principal / n)),
        }
    }

    fn anchor_date(&self) -> Result<NaiveDate, LoanError> {
        let start = self.params.start_date;
        if let Some(first) = self.params.first_payment_date {
            return sub_months(first.max(start), self.months_per_period());
        }
        if self.params.payment_end_of_month && !is_month_end(start) {
            // last day of the previous month
            return start
                .with_day(1)
                .and_then(|d| d.pred_opt())
                .ok_or_else(|| LoanError::Validation(format!("date {} is out of range", start)));
        }
        Ok(start)
    }

    fn period_end(&self, anchor: NaiveDate, index: u32) -> Result<NaiveDate, LoanError> {
        let date = add_months(anchor, index * self.months_per_period())?;
        if self.params.payment_end_of_month && self.params.first_payment_date.is_none() {
            Ok(end_of_month(date))
        } else {
            Ok(date)
        }
    }

    /// Expands every special payment into its dated occurrences, summing same-day amounts.
    fn merged_special_payments(&self) -> Result<BTreeMap<NaiveDate, Decimal>, LoanError> {
        let mut merged = BTreeMap::new();
        for special in &self.special_payments {
            let step = 12 / special.annual_payments;
            for k in 0..special.term_in_periods {
                let date = add_months(special.first_payment_date, k * step)?;
                *merged.entry(date).or_insert(Decimal::ZERO) += special.amount;
            }
        }
        Ok(merged)
    }

    fn interest(&self, balance: Decimal, from: NaiveDate, to: NaiveDate) -> Result<Decimal, LoanError> {
        if balance.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let factor = day_count_factor(
            from,
            to,
            self.params.compounding_method,
            self.params.payment_end_of_month,
        )?;
        balance
            .checked_mul(self.rate)
            .and_then(|amount| amount.checked_mul(factor))
            .map(quantize)
            .ok_or_else(|| out_of_range("interest"))
    }

    pub fn build_schedule(&self) -> Result<Vec<Payment>, LoanError> {
        let principal = quantize(self.params.principal);
        let start = self.params.start_date;
        let total = self.total_periods();
        let interest_only = self.interest_only_period();
        let installment = self.regular_payment()?;
        let anchor = self.anchor_date()?;
        let specials = self.merged_special_payments()?;

        let mut schedule = vec![Payment {
            date: start,
            payment_amount: Decimal::ZERO,
            interest_amount: Decimal::ZERO,
            regular_principal: Decimal::ZERO,
            special_principal: Decimal::ZERO,
            total_principal: Decimal::ZERO,
            balance_end_of_period: principal,
        }];
        let mut balance = principal;
        let mut previous = start;

        for i in 1..=total {
            let date = self.period_end(anchor, i)?;
            let amortizing = i > interest_only;

            for (&special_date, &amount) in specials.range((Excluded(previous), Excluded(date))) {
                let interest = self.interest(balance, previous, special_date)?;
                let special = if amortizing { amount.min(balance) } else { Decimal::ZERO };
                let row = payment_row(special_date, balance, interest, Decimal::ZERO, special);
                balance = row.balance_end_of_period;
                previous = special_date;
                schedule.push(row);
            }

            let interest = self.interest(balance, previous, date)?;
            let mut regular = if balance.is_zero() || !amortizing {
                Decimal::ZERO
            } else {
                match self.params.loan_type {
                    LoanType::Annuity => (installment - interest).max(Decimal::ZERO).min(balance),
                    _ => installment.min(balance),
                }
            };
            let scheduled_special = specials.get(&date).copied().unwrap_or(Decimal::ZERO);
            let special = if amortizing {
                (balance - regular).min(scheduled_special)
            } else {
                Decimal::ZERO
            };
            if i == total && self.params.payment_amount.is_none() {
                // maturity settles rounding residue and interest-only bullets
                regular = balance - special;
            }

            let row = payment_row(date, balance, interest, regular, special);
            balance = row.balance_end_of_period;
            previous = date;
            schedule.push(row);
        }

        debug!(
            "Built schedule of {} rows for {} over {} periods",
            schedule.len(),
            principal,
            total
        );

        Ok(schedule)
    }

    pub fn summarize(&self) -> Result<LoanSummary, LoanError> {
        let schedule = self.build_schedule()?;
        Ok(summarize_schedule(quantize(self.params.principal), &schedule))
    }

    /// Schedule and its summary from a single build.
    pub fn schedule_with_summary(&self) -> Result<(Vec<Payment>, LoanSummary), LoanError> {
        let schedule = self.build_schedule()?;
        let summary = summarize_schedule(quantize(self.params.principal), &schedule);
        Ok((schedule, summary))
    }
}

fn payment_row(
    date: NaiveDate,
    balance: Decimal,
    interest: Decimal,
    regular: Decimal,
    special: Decimal,
) -> Payment {
    let total_principal = quantize((regular + special).min(balance));
    let balance_end = quantize((balance - total_principal).max(Decimal::ZERO));
    Payment {
        date,
        payment_amount: quantize(total_principal + interest),
        interest_amount: interest,
        regular_principal: quantize(regular),
        special_principal: quantize(special),
        total_principal,
        balance_end_of_period: balance_end,
    }
}

pub(crate) fn summarize_schedule(loan_amount: Decimal, schedule: &[Payment]) -> LoanSummary {
    let total_payment_amount: Decimal = schedule.iter().map(|p| p.payment_amount).sum();
    let total_principal_amount: Decimal = schedule.iter().map(|p| p.total_principal).sum();
    let total_interest_amount: Decimal = schedule.iter().map(|p| p.interest_amount).sum();
    let residual_loan_balance = schedule
        .last()
        .map(|p| p.balance_end_of_period)
        .unwrap_or(loan_amount);
    let repayment_to_principal = if total_principal_amount.is_zero() {
        Decimal::ZERO
    } else {
        quantize(total_payment_amount / total_principal_amount)
    };

    LoanSummary {
        loan_amount,
        total_payment_amount,
        total_principal_amount,
        total_interest_amount,
        residual_loan_balance,
        repayment_to_principal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::loan::CompoundingMethod;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn params(principal: Decimal, rate: Decimal, years: u32, start: NaiveDate) -> LoanParams {
        LoanParams {
            principal,
            annual_rate: rate,
            term_years: years,
            start_date: start,
            first_payment_date: None,
            payment_end_of_month: true,
            annual_payments: 12,
            interest_only_period: 0,
            compounding_method: CompoundingMethod::Thirty360E,
            loan_type: LoanType::Annuity,
            payment_amount: None,
        }
    }

    fn assert_row_invariants(schedule: &[Payment], principal: Decimal) {
        let repaid: Decimal = schedule.iter().map(|p| p.total_principal).sum();
        assert!(repaid <= principal);
        for row in schedule {
            assert_eq!(row.payment_amount, row.interest_amount + row.total_principal);
            assert!(!row.balance_end_of_period.is_sign_negative());
        }
    }

    #[test]
    fn annuity_month_end_schedule() {
        let loan = Loan::new(params(dec!(100000), dec!(5), 10, date(2020, 1, 31))).unwrap();
        let schedule = loan.build_schedule().unwrap();

        assert_eq!(schedule.len(), 121);
        assert_eq!(schedule[0].date, date(2020, 1, 31));
        assert_eq!(schedule[0].payment_amount, Decimal::ZERO);
        assert_eq!(schedule[0].balance_end_of_period, dec!(100000));

        assert_eq!(schedule[1].date, date(2020, 2, 29));
        // 30E/360 counts 29 days from Jan 31 to Feb 29
        assert_eq!(schedule[1].interest_amount, dec!(402.78));
        assert_eq!(schedule[1].payment_amount, dec!(1060.66));
        assert_eq!(schedule[2].date, date(2020, 3, 31));

        assert_eq!(schedule[120].date, date(2030, 1, 31));
        assert_eq!(schedule[120].balance_end_of_period, Decimal::ZERO);
        assert_row_invariants(&schedule, dec!(100000));
    }

    #[test]
    fn special_payment_inserts_row_before_regular_period() {
        let mut loan = Loan::new(params(dec!(10000), dec!(6), 2, date(2020, 1, 31))).unwrap();
        loan.add_special_payment(SpecialPayment {
            amount: dec!(2000),
            first_payment_date: date(2020, 6, 15),
            term_in_periods: 1,
            annual_payments: 12,
        })
        .unwrap();

        let schedule = loan.build_schedule().unwrap();
        assert_eq!(schedule.len(), 26);

        let idx = schedule.iter().position(|p| p.date == date(2020, 6, 15)).unwrap();
        assert_eq!(schedule[idx - 1].date, date(2020, 5, 31));
        assert_eq!(schedule[idx + 1].date, date(2020, 6, 30));

        let special = &schedule[idx];
        assert_eq!(special.special_principal, dec!(2000));
        assert_eq!(special.regular_principal, Decimal::ZERO);

        // regular row only accrues interest over the 15 days after the special payment
        let regular = &schedule[idx + 1];
        let factor =
            day_count_factor(date(2020, 6, 15), date(2020, 6, 30), CompoundingMethod::Thirty360E, true).unwrap();
        assert_eq!(factor, Decimal::from(15) / Decimal::from(360));
        let expected = (special.balance_end_of_period * dec!(0.06) * factor).round_dp(2);
        assert_eq!(regular.interest_amount, expected);

        assert_eq!(schedule.last().unwrap().balance_end_of_period, Decimal::ZERO);
        assert_row_invariants(&schedule, dec!(10000));
    }

    #[test]
    fn same_day_special_payments_are_summed() {
        let mut loan = Loan::new(params(dec!(10000), dec!(6), 2, date(2020, 1, 31))).unwrap();
        for _ in 0..2 {
            loan.add_special_payment(SpecialPayment {
                amount: dec!(500),
                first_payment_date: date(2020, 4, 10),
                term_in_periods: 1,
                annual_payments: 12,
            })
            .unwrap();
        }
        let schedule = loan.build_schedule().unwrap();
        let rows: Vec<_> = schedule.iter().filter(|p| p.date == date(2020, 4, 10)).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].special_principal, dec!(1000));
    }

    #[test]
    fn linear_loan_repays_equal_principal() {
        let mut p = params(dec!(1200), dec!(12), 1, date(2021, 1, 15));
        p.loan_type = LoanType::Linear;
        p.payment_end_of_month = false;
        let schedule = Loan::new(p).unwrap().build_schedule().unwrap();
        assert!(schedule[1..].iter().all(|row| row.regular_principal == dec!(100)));
        assert_eq!(schedule[1].interest_amount, dec!(12.00));
        assert_eq!(schedule.last().unwrap().balance_end_of_period, Decimal::ZERO);
    }

    #[test]
    fn interest_only_period_defers_principal() {
        let mut p = params(dec!(12000), dec!(6), 1, date(2021, 1, 31));
        p.interest_only_period = 3;
        let schedule = Loan::new(p).unwrap().build_schedule().unwrap();
        for row in &schedule[1..=3] {
            assert_eq!(row.total_principal, Decimal::ZERO);
            assert!(row.interest_amount > Decimal::ZERO);
        }
        assert!(schedule[4].total_principal > Decimal::ZERO);
        assert_eq!(schedule.last().unwrap().balance_end_of_period, Decimal::ZERO);
    }

    #[test]
    fn interest_only_loan_repays_at_maturity() {
        let mut p = params(dec!(5000), dec!(4), 1, date(2021, 1, 31));
        p.loan_type = LoanType::InterestOnly;
        let schedule = Loan::new(p).unwrap().build_schedule().unwrap();
        assert!(schedule[1..12].iter().all(|row| row.total_principal.is_zero()));
        assert_eq!(schedule[12].total_principal, dec!(5000));
        assert_eq!(schedule[12].balance_end_of_period, Decimal::ZERO);
    }

    #[test]
    fn insufficient_payment_override_leaves_residual_balance() {
        let mut p = params(dec!(10000), dec!(5), 1, date(2021, 1, 31));
        p.payment_amount = Some(dec!(100));
        let loan = Loan::new(p).unwrap();
        let summary = loan.summarize().unwrap();
        assert!(summary.residual_loan_balance > Decimal::ZERO);
    }

    #[test]
    fn first_payment_date_sets_the_cadence() {
        let mut p = params(dec!(1000), dec!(3), 1, date(2021, 1, 10));
        p.first_payment_date = Some(date(2021, 2, 20));
        let schedule = Loan::new(p).unwrap().build_schedule().unwrap();
        assert_eq!(schedule[1].date, date(2021, 2, 20));
        assert_eq!(schedule[2].date, date(2021, 3, 20));
    }

    #[test]
    fn mid_month_start_pays_at_month_end() {
        let schedule = Loan::new(params(dec!(1000), dec!(3), 1, date(2021, 1, 15)))
            .unwrap()
            .build_schedule()
            .unwrap();
        assert_eq!(schedule[1].date, date(2021, 1, 31));
        assert_eq!(schedule[2].date, date(2021, 2, 28));
    }

    #[test]
    fn summary_aggregates_schedule() {
        let loan = Loan::new(params(dec!(100000), dec!(5), 10, date(2020, 1, 31))).unwrap();
        let summary = loan.summarize().unwrap();
        assert_eq!(summary.loan_amount, dec!(100000));
        assert_eq!(summary.total_principal_amount, dec!(100000));
        assert_eq!(summary.residual_loan_balance, Decimal::ZERO);
        assert_eq!(
            summary.total_payment_amount,
            summary.total_principal_amount + summary.total_interest_amount
        );
        assert!(summary.repayment_to_principal > Decimal::ONE);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let mut p = params(dec!(-1), dec!(5), 1, date(2021, 1, 31));
        assert!(Loan::new(p.clone()).is_err());
        p.principal = dec!(100);
        p.annual_payments = 3;
        assert!(matches!(Loan::new(p.clone()), Err(LoanError::Validation(_))));
        p.annual_payments = 12;
        p.term_years = 0;
        assert!(Loan::new(p.clone()).is_err());
        p.term_years = 1;
        p.interest_only_period = 12;
        assert!(Loan::new(p).is_err());
    }

    #[test]
    fn steep_rates_still_amortize() {
        let p = params(dec!(1000), dec!(1000), 10, date(2020, 1, 31));
        let schedule = Loan::new(p).unwrap().build_schedule().unwrap();

        assert_eq!(schedule.len(), 121);
        // the growth factor leaves decimal range, so the installment is pure interest
        assert!(schedule[1].payment_amount > Decimal::ZERO);
        assert_eq!(schedule.last().unwrap().balance_end_of_period, Decimal::ZERO);
        assert_row_invariants(&schedule, dec!(1000));
    }

    #[test]
    fn terms_beyond_the_calendar_are_rejected() {
        let p = params(dec!(1000), dec!(5), u32::MAX, date(2020, 1, 31));
        assert!(matches!(Loan::new(p), Err(LoanError::Validation(_))));

        let p = params(dec!(1000), dec!(5), 400_000, date(2020, 1, 31));
        assert!(matches!(Loan::new(p), Err(LoanError::Validation(_))));
    }

    #[test]
    fn special_payments_must_fall_inside_the_term() {
        let mut loan = Loan::new(params(dec!(10000), dec!(6), 2, date(2020, 1, 31))).unwrap();
        assert_eq!(loan.maturity_date().unwrap(), date(2022, 1, 31));

        let special = |on: NaiveDate, term_in_periods: u32| SpecialPayment {
            amount: dec!(500),
            first_payment_date: on,
            term_in_periods,
            annual_payments: 12,
        };

        for rejected in [
            special(date(2020, 1, 31), 1),
            special(date(2019, 12, 1), 1),
            special(date(2022, 2, 15), 1),
            special(date(2021, 6, 15), 12),
        ] {
            assert!(matches!(
                loan.add_special_payment(rejected),
                Err(LoanError::Validation(_))
            ));
        }

        loan.add_special_payment(special(date(2022, 1, 31), 1)).unwrap();
        let schedule = loan.build_schedule().unwrap();
        // a special on a regular date shares that row
        assert_eq!(schedule.len(), 25);
        let last = schedule.last().unwrap();
        assert_eq!(last.date, date(2022, 1, 31));
        assert_eq!(last.balance_end_of_period, Decimal::ZERO);
    }
}
