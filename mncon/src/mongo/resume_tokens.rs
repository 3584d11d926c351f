use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::ResumeToken;
use mongodb::options::FindOneOptions;

use super::Error;

/// Accessor for a watched collection's resume-token sidecar.
///
/// Each record is `{_id: <event id>, token: <resume token>, ts: <wall clock>}`.
/// Records are only ever appended; a capped sidecar evicts by insertion
/// order, an uncapped one keeps full history.
pub(crate) struct ResumeTokens {
    collection: mongodb::Collection<Document>,
    capped: bool,
}

impl ResumeTokens {
    pub(crate) fn new(
        client: &mongodb::Client,
        db_name: &str,
        coll_name: &str,
        capped: bool,
    ) -> Self {
        let collection = client.database(db_name).collection::<Document>(coll_name);
        Self { collection, capped }
    }

    /// The most recent token: greatest event id for uncapped sidecars,
    /// latest inserted record for capped ones.
    pub(crate) async fn last_token(&self) -> Result<Option<ResumeToken>, Error> {
        let options = FindOneOptions::builder()
            .sort(latest_sort(self.capped))
            .build();
        let found = self.collection.find_one(doc! {}).with_options(options).await?;
        Ok(found
            .and_then(|record| record.get("token").cloned())
            .and_then(|token| bson::from_bson(token).ok()))
    }

    pub(crate) async fn persist(&self, event_id: &str, token: &ResumeToken) -> Result<(), Error> {
        let record = doc! {
            "_id": event_id,
            "token": bson::to_bson(token)?,
            "ts": Bson::DateTime(bson::DateTime::now()),
        };
        match self.collection.insert_one(record).await {
            Ok(_) => Ok(()),
            // A crash between publish and persist replays the event on
            // restart; the record for its id is already durable.
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn latest_sort(capped: bool) -> Document {
    if capped {
        doc! {"$natural": -1}
    } else {
        doc! {"_id": -1}
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(write_err))
            if write_err.code == 11000
    )
}
