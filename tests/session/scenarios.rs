//! BDD scenarios for the reservation session lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{SessionContext, session_context};

#[scenario(
    path = "tests/features/session.feature",
    name = "Lease a device and release it after the job"
)]
fn scenario_lease_and_release(session_context: SessionContext) {
    let _ = session_context;
}

#[scenario(
    path = "tests/features/session.feature",
    name = "Report a missing device as not built"
)]
fn scenario_missing_device(session_context: SessionContext) {
    let _ = session_context;
}

#[scenario(
    path = "tests/features/session.feature",
    name = "Tear down when no device comes online"
)]
fn scenario_connection_timeout(session_context: SessionContext) {
    let _ = session_context;
}

#[scenario(
    path = "tests/features/session.feature",
    name = "Give back devices already claimed when a reservation fails part-way"
)]
fn scenario_partial_reservation(session_context: SessionContext) {
    let _ = session_context;
}
