//! School-administration entities handled by the command engine.
//!
//! Only the fields the engine's typed accessors need are modeled here;
//! validation rules live with the calling facades.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// An entity the command engine can snapshot, persist, and roll back.
pub trait PersistEntity:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Stable name used in error messages and command ids (`student`, ...).
    const ENTITY_NAME: &'static str;

    fn id(&self) -> Option<Uuid>;

    fn set_id(&mut self, id: Option<Uuid>);

    /// Detached copy handed to callers and the undo cache.
    ///
    /// Never returns the live instance a gateway may hold.
    fn adopt_copy(&self) -> Self {
        self.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Student {
    pub id: Option<Uuid>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub faculty_id: Option<Uuid>,
}

impl PersistEntity for Student {
    const ENTITY_NAME: &'static str = "student";

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn set_id(&mut self, id: Option<Uuid>) {
        self.id = id;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Course {
    pub id: Option<Uuid>,
    pub title: String,
    pub credits: u32,
    pub faculty_id: Option<Uuid>,
}

impl PersistEntity for Course {
    const ENTITY_NAME: &'static str = "course";

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn set_id(&mut self, id: Option<Uuid>) {
        self.id = id;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Faculty {
    pub id: Option<Uuid>,
    pub name: String,
}

impl PersistEntity for Faculty {
    const ENTITY_NAME: &'static str = "faculty";

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn set_id(&mut self, id: Option<Uuid>) {
        self.id = id;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: Option<Uuid>,
    pub student_id: Option<Uuid>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl PersistEntity for Profile {
    const ENTITY_NAME: &'static str = "profile";

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn set_id(&mut self, id: Option<Uuid>) {
        self.id = id;
    }
}
