//! `transfer(to, amount)` - move value between holders.

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

pub(crate) struct TransferHandler;

impl TransferHandler {
    fn params(tx: &ParsedTransaction) -> Result<&super::TransferParams> {
        match &tx.params {
            FunctionParams::Transfer(params) => Ok(params),
            _ => Err(NotoError::ParamInvalid("expected transfer parameters".into())),
        }
    }
}

#[async_trait]
impl FunctionHandler for TransferHandler {
    fn init(
        &self,
        tx: &ParsedTransaction,
        _request: &pb::InitTransactionRequest,
    ) -> Result<pb::InitTransactionResponse> {
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
        let params = Self::params(tx)?;
        let from_address = find_eth_verifier(&tx.from, &request.resolved_verifiers)?;
        let to_address = find_eth_verifier(&params.to, &request.resolved_verifiers)?;
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
        let mut new_coins = vec![NotoCoin::new_random(to_address, params.amount)];
        if selection.total > params.amount {
            new_coins.push(NotoCoin::new_random(
                from_address,
                selection.total - params.amount,
            ));
        }
        let mut output_states = Vec::with_capacity(new_coins.len());
        let mut output_ids = Vec::with_capacity(new_coins.len());
        for coin in &new_coins {
            let data = coin.to_data_json();
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
        let params = Self::params(tx)?;
        let (input_coins, input_ids) = parse_coin_list("input", &request.inputs)?;
        let (output_coins, output_ids) = parse_coin_list("output", &request.outputs)?;

        // Value is conserved: a transfer burns nothing
        if total_amount(&input_coins) != total_amount(&output_coins) {
            return Err(NotoError::AmountMismatch(
                "inputs and outputs do not balance".into(),
            ));
        }

        let from_address = find_eth_verifier(&tx.from, &request.resolved_verifiers)?;
        let to_address = find_eth_verifier(&params.to, &request.resolved_verifiers)?;
        let to_recipient: alloy::primitives::U256 = output_coins
            .iter()
            .filter(|c| c.owner == to_address)
            .fold(alloy::primitives::U256::ZERO, |acc, c| acc + c.amount);
        if to_recipient != params.amount {
            return Err(NotoError::AmountMismatch(format!(
                "recipient receives {to_recipient}, expected {}",
                params.amount
            )));
        }

        for (coin, id) in input_coins.iter().zip(&input_ids) {
            if coin.owner != from_address {
                return Err(NotoError::OwnershipViolation(format!("{id:#x}")));
            }
        }
        for (coin, id) in output_coins.iter().zip(&output_ids) {
            if coin.owner != from_address && coin.owner != to_address {
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
        transfer_invoke(tx, request)
    }
}
