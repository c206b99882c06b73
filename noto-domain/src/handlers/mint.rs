//! `mint(to, amount)` - create new coins, gated to the notary by default.

use alloy::primitives::Address;
use async_trait::async_trait;

use paladin_plugin::pb;
use paladin_state::state::state_id;

use crate::coins::{parse_state_id, transfer_payload, NotoCoin};
use crate::error::{NotoError, Result};
use crate::Noto;

use super::{
    attestation_plan, eth_address_verifiers, find_eth_verifier, parse_coin_list, total_amount,
    transfer_invoke, validate_sender_signature, FunctionHandler, FunctionParams,
    ParsedTransaction,
};

pub(crate) struct MintHandler;

impl MintHandler {
    fn check_allowed(tx: &ParsedTransaction) -> Result<()> {
        if tx.config.restrict_mint && tx.from != tx.config.notary {
            return Err(NotoError::NotAllowed("mint"));
        }
        Ok(())
    }

    fn params(tx: &ParsedTransaction) -> Result<&super::MintParams> {
        match &tx.params {
            FunctionParams::Mint(params) => Ok(params),
            _ => Err(NotoError::ParamInvalid("expected mint parameters".into())),
        }
    }
}

#[async_trait]
impl FunctionHandler for MintHandler {
    fn init(
        &self,
        tx: &ParsedTransaction,
        _request: &pb::InitTransactionRequest,
    ) -> Result<pb::InitTransactionResponse> {
        Self::check_allowed(tx)?;
        let params = Self::params(tx)?;
        Ok(pb::InitTransactionResponse {
            required_verifiers: eth_address_verifiers(&[
                &tx.config.notary,
                &tx.from,
                &params.to,
            ]),
        })
    }

    async fn assemble(
        &self,
        noto: &Noto,
        tx: &ParsedTransaction,
        request: &pb::AssembleTransactionRequest,
    ) -> Result<pb::AssembleTransactionResponse> {
        Self::check_allowed(tx)?;
        let params = Self::params(tx)?;
        let to_address = find_eth_verifier(&params.to, &request.resolved_verifiers)?;
        let schema_id = noto.coin_schema_id().await?;
        let schema = parse_state_id(&schema_id)?;

        let coin = NotoCoin::new_random(to_address, params.amount);
        let data = coin.to_data_json();
        let id = state_id(schema, &data);
        let output_states = vec![pb::NewState {
            id: Some(format!("{id:#x}")),
            schema_id: schema_id.clone(),
            state_data_json: data.to_string(),
        }];

        let contract: Address = tx
            .contract_address
            .parse()
            .map_err(|_| NotoError::DataInvalid("malformed contract address".into()))?;
        let payload = transfer_payload(contract, &[], &[id]);

        Ok(pb::AssembleTransactionResponse {
            assembly_result: pb::assemble_transaction_response::AssemblyResult::Ok as i32,
            assembled_transaction: Some(pb::AssembledTransaction {
                input_states: Vec::new(),
                output_states,
                info_states: Vec::new(),
            }),
            attestation_plan: attestation_plan(tx, payload),
            revert_reason: None,
        })
    }

    async fn endorse(
        &self,
        noto: &Noto,
        tx: &ParsedTransaction,
        request: &pb::EndorseTransactionRequest,
    ) -> Result<pb::EndorseTransactionResponse> {
        Self::check_allowed(tx)?;
        let params = Self::params(tx)?;
        if !request.inputs.is_empty() {
            return Err(NotoError::AmountMismatch("mint cannot spend inputs".into()));
        }
        let (output_coins, output_ids) = parse_coin_list("output", &request.outputs)?;
        if total_amount(&output_coins) != params.amount {
            return Err(NotoError::AmountMismatch(format!(
                "minted {}, expected {}",
                total_amount(&output_coins),
                params.amount
            )));
        }
        let to_address = find_eth_verifier(&params.to, &request.resolved_verifiers)?;
        for (coin, id) in output_coins.iter().zip(&output_ids) {
            if coin.owner != to_address {
                return Err(NotoError::OwnershipViolation(format!("{id:#x}")));
            }
        }

        let contract: Address = tx
            .contract_address
            .parse()
            .map_err(|_| NotoError::DataInvalid("malformed contract address".into()))?;
        let payload = transfer_payload(contract, &[], &output_ids);
        validate_sender_signature(
            noto,
            tx,
            &request.signatures,
            &request.resolved_verifiers,
            &payload,
        )
        .await?;

        Ok(pb::EndorseTransactionResponse {
            endorsement_result:
                pb::endorse_transaction_response::EndorsementResult::EndorserSubmit as i32,
            payload: None,
            revert_reason: None,
        })
    }

    async fn prepare(
        &self,
        _noto: &Noto,
        tx: &ParsedTransaction,
        request: &pb::PrepareTransactionRequest,
    ) -> Result<pb::PrepareTransactionResponse> {
        Self::check_allowed(tx)?;
        transfer_invoke(tx, request)
    }
}
