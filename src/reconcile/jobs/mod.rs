mod appointment_auto_completion;
mod review_eligibility_grant;
mod trial_expiry_deactivation;

pub use appointment_auto_completion::{AppointmentAutoCompletionJob, AUTO_COMPLETION_REASON};
pub use review_eligibility_grant::ReviewEligibilityGrantJob;
pub use trial_expiry_deactivation::{TrialExpiryDeactivationJob, TRIAL_EXPIRED_REASON};
