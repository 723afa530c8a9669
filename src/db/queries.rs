use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::models::job::{ChatId, JobId};
use crate::models::label::Label;
use crate::models::prediction::PredictionRecord;

/// Insert a prediction, overwriting any earlier write for the same id.
///
/// A redelivered job rewrites its record with equivalent content, so the table
/// never holds more than one row per prediction.
pub async fn upsert_prediction(pool: &PgPool, record: &PredictionRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO predictions
            (prediction_id, original_img_path, predicted_img_path, labels, time, chat_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (prediction_id) DO UPDATE
        SET original_img_path = EXCLUDED.original_img_path,
            predicted_img_path = EXCLUDED.predicted_img_path,
            labels = EXCLUDED.labels,
            time = EXCLUDED.time,
            chat_id = EXCLUDED.chat_id,
            write_count = predictions.write_count + 1
        "#,
    )
    .bind(record.prediction_id.0)
    .bind(&record.original_img_path)
    .bind(&record.predicted_img_path)
    .bind(Json(&record.labels))
    .bind(record.time)
    .bind(record.chat_id.0)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a prediction by id
pub async fn get_prediction(
    pool: &PgPool,
    prediction_id: &JobId,
) -> Result<Option<PredictionRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT prediction_id, original_img_path, predicted_img_path, labels, time, chat_id
        FROM predictions
        WHERE prediction_id = $1
        "#,
    )
    .bind(prediction_id.0)
    .fetch_optional(pool)
    .await?;

    row.map(|r| -> Result<PredictionRecord, sqlx::Error> {
        let labels: Json<Vec<Label>> = r.try_get("labels")?;
        Ok(PredictionRecord {
            prediction_id: JobId(r.try_get("prediction_id")?),
            original_img_path: r.try_get("original_img_path")?,
            predicted_img_path: r.try_get("predicted_img_path")?,
            labels: labels.0,
            time: r.try_get("time")?,
            chat_id: ChatId(r.try_get("chat_id")?),
        })
    })
    .transpose()
}
