//! `burn(amount)` - destroy coins, returning change to the sender.

use alloy::primitives::Address;
use async_trait::async_trait;

use paladin_plugin::pb;
use paladin_state::state::state_id;

use crate::coins::{parse_state_id, select_coins, transfer_payload, NotoCoin};
use crate::error::{NotoError, Result};
use crate::Noto;

use super::{
    attestation_plan, eth_address_verifiers, find_eth_verifier, parse_coin_list, revert_assembly,
    total_amount, transfer_invoke, validate_sender_signature, FunctionHandler, FunctionParams,
    ParsedTransaction,
};

pub(crate) struct BurnHandler;

impl BurnHandler {
    fn check_allowed(tx: &ParsedTransaction) -> Result<()> {
        if tx.config.allow_burn {
            Ok(())
        } else {
            Err(NotoError::NotAllowed("burn"))
        }
    }

    fn params(tx: &ParsedTransaction) -> Result<&super::BurnParams> {
        match &tx.params {
            FunctionParams::Burn(params) => Ok(params),
            _ => Err(NotoError::ParamInvalid("expected burn parameters".into())),
        }
    }
}

#[async_trait]
impl FunctionHandler for BurnHandler {
    fn init(
        &self,
        tx: &ParsedTransaction,
        _request: &pb::InitTransactionRequest,
    ) -> Result<pb::InitTransactionResponse> {
        Self::check_allowed(tx)?;
        Ok(pb::InitTransactionResponse {
            required_verifiers: eth_address_verifiers(&[&tx.config.notary, &tx.from]),
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
        let from_address = find_eth_verifier(&tx.from, &request.resolved_verifiers)?;
        let schema_id = noto.coin_schema_id().await?;

        let selection = match select_coins(
            noto.callbacks().as_ref(),
            &tx.contract_address,
            &schema_id,
            from_address,
            params.amount,
        )
        .await
        {
            Ok(selection) => selection,
            Err(shortfall @ NotoError::InsufficientFunds { .. }) => {
                return Ok(revert_assembly(shortfall.to_string()));
            }
            Err(error) => return Err(error),
        };

        let schema = parse_state_id(&schema_id)?;
        let mut output_states = Vec::new();
        let mut output_ids = Vec::new();
        if selection.total > params.amount {
            let change = NotoCoin::new_random(from_address, selection.total - params.amount);
            let data = change.to_data_json();
            let id = state_id(schema, &data);
            output_ids.push(id);
            output_states.push(pb::NewState {
                id: Some(format!("{id:#x}")),
                schema_id: schema_id.clone(),
                state_data_json: data.to_string(),
            });
        }

        let input_ids = selection
            .states
            .iter()
            .map(|s| parse_state_id(&s.id))
            .collect::<Result<Vec<_>>>()?;
        let contract: Address = tx
            .contract_address
            .parse()
            .map_err(|_| NotoError::DataInvalid("malformed contract address".into()))?;
        let payload = transfer_payload(contract, &input_ids, &output_ids);

        Ok(pb::AssembleTransactionResponse {
            assembly_result: pb::assemble_transaction_response::AssemblyResult::Ok as i32,
            assembled_transaction: Some(pb::AssembledTransaction {
                input_states: selection.states,
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
        let (input_coins, input_ids) = parse_coin_list("input", &request.inputs)?;
        let (output_coins, output_ids) = parse_coin_list("output", &request.outputs)?;

        let burned = total_amount(&input_coins)
            .checked_sub(total_amount(&output_coins))
            .ok_or_else(|| NotoError::AmountMismatch("outputs exceed inputs".into()))?;
        if burned != params.amount {
            return Err(NotoError::AmountMismatch(format!(
                "burned {burned}, expected {}",
                params.amount
            )));
        }

        let from_address = find_eth_verifier(&tx.from, &request.resolved_verifiers)?;
        for (coin, id) in input_coins.iter().zip(&input_ids) {
            if coin.owner != from_address {
                return Err(NotoError::OwnershipViolation(format!("{id:#x}")));
            }
        }
        for (coin, id) in output_coins.iter().zip(&output_ids) {
            // burn change always returns to the sender
            if coin.owner != from_address {
                return Err(NotoError::OwnershipViolation(format!("{id:#x}")));
            }
        }

        let contract: Address = tx
            .contract_address
            .parse()
            .map_err(|_| NotoError::DataInvalid("malformed contract address".into()))?;
        let payload = transfer_payload(contract, &input_ids, &output_ids);
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
