// src/handlers/loans.rs

use crate::{
    errors::AppResult,
    models::loan::{LoanScheduleRequest, LoanScheduleResponse},
    services::amortization::Loan,
};
use axum::Json;
use tracing::debug;

/// Build the amortization schedule of a loan
#[utoipa::path(
    post,
    path = "/api/v1/loans/schedule",
    request_body = LoanScheduleRequest,
    responses(
        (status = 200, description = "Payment schedule and summary", body = LoanScheduleResponse),
        (status = 400, description = "Invalid loan parameters"),
    ),
    tag = "Loans"
)]
pub async fn loan_schedule(
    Json(body): Json<LoanScheduleRequest>,
) -> AppResult<Json<LoanScheduleResponse>> {
    let mut loan = Loan::new(body.loan)?;
    for special in body.special_payments {
        loan.add_special_payment(special)?;
    }
    let (schedule, summary) = loan.schedule_with_summary()?;
    debug!(
        "Loan schedule built: {} rows, {} interest",
        schedule.len(),
        summary.total_interest_amount
    );

    Ok(Json(LoanScheduleResponse { schedule, summary }))
}
