use super::ApiResult;
use crate::config::{AppState, CompositionDocument};
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use waveflow_core::{CompositionExecutionReport, FunctionComposition, Params};

/// List registered compositions
pub async fn list_compositions(
    State(state): State<Arc<AppState>>,
) -> Json<ListCompositionsResponse> {
    Json(ListCompositionsResponse {
        compositions: state.registry.list(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListCompositionsResponse {
    pub compositions: Vec<String>,
}

/// Register a new composition
pub async fn create_composition(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompositionDocument>,
) -> ApiResult<Json<CreateCompositionResponse>> {
    let composition = state.registry.register(req.into_composition()?)?;

    Ok(Json(CreateCompositionResponse {
        created: composition.name.clone(),
        functions: composition.functions.clone(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCompositionResponse {
    pub created: String,
    pub functions: Vec<String>,
}

/// Get a specific composition
pub async fn get_composition(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<FunctionComposition>> {
    let composition = state.registry.get(&name)?;
    Ok(Json(composition.as_ref().clone()))
}

/// Remove a composition
pub async fn delete_composition(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<DeleteCompositionResponse>> {
    let removed = state.registry.remove(&name)?;
    Ok(Json(DeleteCompositionResponse {
        deleted: removed.name.clone(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteCompositionResponse {
    pub deleted: String,
}

/// Run a composition to completion
pub async fn invoke_composition(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<Json<CompositionExecutionReport>> {
    let composition = state.registry.get(&name)?;
    let report = state.executor.invoke(&composition, req.params).await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub params: Params,
}
