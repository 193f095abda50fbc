pub mod updates_service;

pub use updates_service::UpdatesService;

use tonic::{Code, Status};

use crate::updates::UpdatesError;

impl From<UpdatesError> for Status {
    fn from(e: UpdatesError) -> Self {
        let code = match &e {
            UpdatesError::InvalidArgument(_) => Code::InvalidArgument,
            UpdatesError::EntityNotFound(_) => Code::NotFound,
            UpdatesError::EntityExists(_) => Code::AlreadyExists,
            UpdatesError::Aborted(_) => Code::Aborted,
            UpdatesError::AllocationConflict { .. } | UpdatesError::Conflict => Code::Unavailable,
            UpdatesError::Storage(_) => Code::Internal,
        };
        Status::new(code, e.to_string())
    }
}
